use std::collections::BTreeMap;

use crate::codec::Decoder;
use crate::{
    SnapshotError, SnapshotHeader, SnapshotResult, SnapshotVersion, SNAPSHOT_FORMAT_VERSION,
    SNAPSHOT_MAGIC,
};

/// Parsed view over a device snapshot produced by [`crate::SnapshotWriter`].
#[derive(Debug)]
pub struct SnapshotReader<'a> {
    header: SnapshotHeader,
    fields: BTreeMap<u16, &'a [u8]>,
}

impl<'a> SnapshotReader<'a> {
    /// Parses `bytes` and checks that the snapshot belongs to `device_id`.
    pub fn parse(bytes: &'a [u8], device_id: [u8; 4]) -> SnapshotResult<Self> {
        let mut d = Decoder::new(bytes);

        let magic = d.bytes(4)?;
        if magic != SNAPSHOT_MAGIC {
            return Err(SnapshotError::InvalidMagic);
        }
        let format_version = SnapshotVersion::new(d.u16()?, d.u16()?);
        if format_version.major != SNAPSHOT_FORMAT_VERSION.major {
            return Err(SnapshotError::UnsupportedFormatVersion {
                major: format_version.major,
                minor: format_version.minor,
            });
        }

        let mut found = [0u8; 4];
        found.copy_from_slice(d.bytes(4)?);
        if found != device_id {
            return Err(SnapshotError::DeviceIdMismatch {
                expected: device_id,
                found,
            });
        }
        let device_version = SnapshotVersion::new(d.u16()?, d.u16()?);

        let mut fields = BTreeMap::new();
        while !d.is_empty() {
            let tag = d.u16()?;
            let len = d.u32()? as usize;
            let value = d.bytes(len)?;
            if fields.insert(tag, value).is_some() {
                return Err(SnapshotError::DuplicateFieldTag(tag));
            }
        }

        Ok(Self {
            header: SnapshotHeader {
                format_version,
                device_id: found,
                device_version,
            },
            fields,
        })
    }

    pub fn header(&self) -> SnapshotHeader {
        self.header
    }

    pub fn ensure_device_major(&self, supported: u16) -> SnapshotResult<()> {
        let found = self.header.device_version.major;
        if found != supported {
            return Err(SnapshotError::UnsupportedDeviceMajorVersion { found, supported });
        }
        Ok(())
    }

    pub fn bytes(&self, tag: u16) -> Option<&'a [u8]> {
        self.fields.get(&tag).copied()
    }

    pub fn u8(&self, tag: u16) -> SnapshotResult<Option<u8>> {
        self.fixed::<1>(tag, "u8 field").map(|v| v.map(|b| b[0]))
    }

    pub fn u16(&self, tag: u16) -> SnapshotResult<Option<u16>> {
        self.fixed::<2>(tag, "u16 field")
            .map(|v| v.map(u16::from_le_bytes))
    }

    pub fn u32(&self, tag: u16) -> SnapshotResult<Option<u32>> {
        self.fixed::<4>(tag, "u32 field")
            .map(|v| v.map(u32::from_le_bytes))
    }

    pub fn u64(&self, tag: u16) -> SnapshotResult<Option<u64>> {
        self.fixed::<8>(tag, "u64 field")
            .map(|v| v.map(u64::from_le_bytes))
    }

    pub fn bool(&self, tag: u16) -> SnapshotResult<Option<bool>> {
        match self.u8(tag)? {
            None => Ok(None),
            Some(0) => Ok(Some(false)),
            Some(1) => Ok(Some(true)),
            Some(_) => Err(SnapshotError::InvalidFieldEncoding("bool field")),
        }
    }

    fn fixed<const N: usize>(
        &self,
        tag: u16,
        what: &'static str,
    ) -> SnapshotResult<Option<[u8; N]>> {
        let Some(bytes) = self.bytes(tag) else {
            return Ok(None);
        };
        let arr: [u8; N] = bytes
            .try_into()
            .map_err(|_| SnapshotError::InvalidFieldEncoding(what))?;
        Ok(Some(arr))
    }
}
