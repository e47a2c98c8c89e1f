use io_snapshot::{
    SnapshotError, SnapshotReader, SnapshotVersion, SnapshotWriter, SNAPSHOT_HEADER_LEN,
};
use pretty_assertions::assert_eq;

const DEVICE_ID: [u8; 4] = *b"TEST";
const VERSION: SnapshotVersion = SnapshotVersion::new(2, 1);

#[test]
fn fields_are_emitted_in_tag_order() {
    let mut a = SnapshotWriter::new(DEVICE_ID, VERSION);
    a.field_u32(9, 0xdead_beef);
    a.field_u8(1, 7);

    let mut b = SnapshotWriter::new(DEVICE_ID, VERSION);
    b.field_u8(1, 7);
    b.field_u32(9, 0xdead_beef);

    assert_eq!(a.finish(), b.finish());
}

#[test]
fn reader_exposes_header_and_typed_fields() {
    let mut w = SnapshotWriter::new(DEVICE_ID, VERSION);
    w.field_u16(1, 0x1234);
    w.field_u64(2, u64::MAX - 1);
    w.field_bool(3, true);
    w.field_bytes(4, b"name".to_vec());
    let bytes = w.finish();

    let r = SnapshotReader::parse(&bytes, DEVICE_ID).unwrap();
    assert_eq!(r.header().device_version, VERSION);
    r.ensure_device_major(2).unwrap();
    assert_eq!(r.u16(1).unwrap(), Some(0x1234));
    assert_eq!(r.u64(2).unwrap(), Some(u64::MAX - 1));
    assert_eq!(r.bool(3).unwrap(), Some(true));
    assert_eq!(r.bytes(4), Some(&b"name"[..]));
    assert_eq!(r.u32(99).unwrap(), None, "missing tags read as None");
}

#[test]
fn wrong_device_id_is_rejected() {
    let bytes = SnapshotWriter::new(*b"OTHR", VERSION).finish();
    let err = SnapshotReader::parse(&bytes, DEVICE_ID).unwrap_err();
    assert_eq!(
        err,
        SnapshotError::DeviceIdMismatch {
            expected: DEVICE_ID,
            found: *b"OTHR"
        }
    );
}

#[test]
fn newer_device_major_is_rejected() {
    let bytes = SnapshotWriter::new(DEVICE_ID, SnapshotVersion::new(3, 0)).finish();
    let r = SnapshotReader::parse(&bytes, DEVICE_ID).unwrap();
    assert_eq!(
        r.ensure_device_major(VERSION.major),
        Err(SnapshotError::UnsupportedDeviceMajorVersion {
            found: 3,
            supported: 2
        })
    );
}

#[test]
fn truncated_field_is_rejected() {
    let mut w = SnapshotWriter::new(DEVICE_ID, VERSION);
    w.field_bytes(1, vec![0xaa; 32]);
    let bytes = w.finish();

    let err = SnapshotReader::parse(&bytes[..bytes.len() - 1], DEVICE_ID).unwrap_err();
    assert_eq!(err, SnapshotError::UnexpectedEof);

    let err = SnapshotReader::parse(&bytes[..SNAPSHOT_HEADER_LEN - 2], DEVICE_ID).unwrap_err();
    assert_eq!(err, SnapshotError::UnexpectedEof);
}

#[test]
fn duplicate_tags_are_rejected() {
    let mut bytes = SnapshotWriter::new(DEVICE_ID, VERSION).finish();
    for _ in 0..2 {
        bytes.extend_from_slice(&5u16.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.push(0);
    }
    let err = SnapshotReader::parse(&bytes, DEVICE_ID).unwrap_err();
    assert_eq!(err, SnapshotError::DuplicateFieldTag(5));
}

#[test]
fn mis_sized_scalar_field_is_rejected() {
    let mut w = SnapshotWriter::new(DEVICE_ID, VERSION);
    w.field_bytes(1, vec![1, 2, 3]);
    w.field_u8(2, 2);
    let bytes = w.finish();

    let r = SnapshotReader::parse(&bytes, DEVICE_ID).unwrap();
    assert_eq!(
        r.u32(1),
        Err(SnapshotError::InvalidFieldEncoding("u32 field"))
    );
    assert_eq!(
        r.bool(2),
        Err(SnapshotError::InvalidFieldEncoding("bool field"))
    );
}

#[test]
fn bad_magic_is_rejected() {
    let mut bytes = SnapshotWriter::new(DEVICE_ID, VERSION).finish();
    bytes[0] ^= 0xff;
    assert_eq!(
        SnapshotReader::parse(&bytes, DEVICE_ID).unwrap_err(),
        SnapshotError::InvalidMagic
    );
}
