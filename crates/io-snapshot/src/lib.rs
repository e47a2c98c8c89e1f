//! Deterministic snapshot encoding for emulated I/O devices.
//!
//! The container is a small tag-length-value (TLV) encoding:
//! - deterministic byte output (fields are emitted in ascending tag order)
//! - forward compatibility (unknown tags are skipped by readers)
//! - explicit versioning (major/minor) for both the container and each device
//!
//! Devices own *what* they persist; this crate owns *how* it is laid out.

pub mod codec;
mod error;
mod reader;
mod writer;

pub use error::{SnapshotError, SnapshotResult};
pub use reader::SnapshotReader;
pub use writer::SnapshotWriter;

/// Magic bytes at the start of every device snapshot.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"IOSN";

/// Container format version written by [`SnapshotWriter`].
pub const SNAPSHOT_FORMAT_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

/// `magic + format version + device id + device version`.
pub const SNAPSHOT_HEADER_LEN: usize = 4 + 4 + 4 + 4;

/// Per-field overhead: `tag: u16` + `len: u32`.
pub const SNAPSHOT_FIELD_HEADER_LEN: usize = 2 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotVersion {
    pub major: u16,
    pub minor: u16,
}

impl SnapshotVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub format_version: SnapshotVersion,
    pub device_id: [u8; 4],
    pub device_version: SnapshotVersion,
}

/// Snapshotting contract for emulated I/O devices.
///
/// Implementations must keep `DEVICE_ID` stable forever and only perform forward-compatible
/// additions within the same major version by adding new TLV fields.
pub trait IoSnapshot {
    const DEVICE_ID: [u8; 4];
    const DEVICE_VERSION: SnapshotVersion;

    fn save_state(&self) -> Vec<u8>;
    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()>;
}
