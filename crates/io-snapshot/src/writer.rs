use std::collections::BTreeMap;

use crate::{SnapshotVersion, SNAPSHOT_FORMAT_VERSION, SNAPSHOT_HEADER_LEN, SNAPSHOT_MAGIC};

/// Builds one device snapshot.
///
/// Fields are buffered and emitted in ascending tag order by [`SnapshotWriter::finish`], so the
/// output does not depend on the order in which a device writes its fields. Writing the same tag
/// twice keeps the last value.
#[derive(Debug, Clone)]
pub struct SnapshotWriter {
    device_id: [u8; 4],
    device_version: SnapshotVersion,
    fields: BTreeMap<u16, Vec<u8>>,
}

impl SnapshotWriter {
    pub fn new(device_id: [u8; 4], device_version: SnapshotVersion) -> Self {
        Self {
            device_id,
            device_version,
            fields: BTreeMap::new(),
        }
    }

    pub fn field_u8(&mut self, tag: u16, value: u8) {
        self.fields.insert(tag, vec![value]);
    }

    pub fn field_u16(&mut self, tag: u16, value: u16) {
        self.fields.insert(tag, value.to_le_bytes().to_vec());
    }

    pub fn field_u32(&mut self, tag: u16, value: u32) {
        self.fields.insert(tag, value.to_le_bytes().to_vec());
    }

    pub fn field_u64(&mut self, tag: u16, value: u64) {
        self.fields.insert(tag, value.to_le_bytes().to_vec());
    }

    pub fn field_bool(&mut self, tag: u16, value: bool) {
        self.field_u8(tag, u8::from(value));
    }

    pub fn field_bytes(&mut self, tag: u16, bytes: Vec<u8>) {
        self.fields.insert(tag, bytes);
    }

    pub fn finish(self) -> Vec<u8> {
        let body_len: usize = self
            .fields
            .values()
            .map(|v| crate::SNAPSHOT_FIELD_HEADER_LEN + v.len())
            .sum();
        let mut out = Vec::with_capacity(SNAPSHOT_HEADER_LEN + body_len);
        out.extend_from_slice(&SNAPSHOT_MAGIC);
        out.extend_from_slice(&SNAPSHOT_FORMAT_VERSION.major.to_le_bytes());
        out.extend_from_slice(&SNAPSHOT_FORMAT_VERSION.minor.to_le_bytes());
        out.extend_from_slice(&self.device_id);
        out.extend_from_slice(&self.device_version.major.to_le_bytes());
        out.extend_from_slice(&self.device_version.minor.to_le_bytes());
        for (tag, value) in self.fields {
            out.extend_from_slice(&tag.to_le_bytes());
            // Field payloads are bounded by what devices put in them; a field that does not fit
            // in u32 is a device bug, not a runtime condition.
            let len = u32::try_from(value.len()).unwrap_or(u32::MAX);
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(&value[..len as usize]);
        }
        out
    }
}
