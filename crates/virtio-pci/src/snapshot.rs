//! Save and restore of transport state.

use io_snapshot::codec::{Decoder, Encoder};
use io_snapshot::{IoSnapshot, SnapshotReader, SnapshotResult, SnapshotVersion, SnapshotWriter};

use crate::pci::{TransportError, VirtioPciDevice};
use crate::queue::QUEUE_NAME_MAX_LEN;
use crate::spec::{DeviceStatus, VIRTQ_MAX_COUNT};

/// Largest backend blob accepted on restore.
const MAX_DEVICE_BLOB_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VirtqueueSnapshot {
    pub name: String,
    pub size: u16,
    pub enabled: bool,
    pub notify_off: u16,
    pub msix_vector: u16,
    pub desc_addr: u64,
    pub avail_addr: u64,
    pub used_addr: u64,
    pub avail_idx_shadow: u16,
    pub used_idx_shadow: u16,
    pub used_event_reached: bool,
}

/// Everything needed to resume a transport instance, including the backend's own blob.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VirtioPciState {
    pub device_status: u8,
    pub prev_device_status: u8,
    pub device_features: u64,
    pub driver_features: u64,
    pub device_feature_select: u32,
    pub driver_feature_select: u32,
    pub config_generation: u8,
    pub gen_update_pending: bool,
    pub isr: u8,
    pub msix_config_vector: u16,
    pub queue_select: u16,
    pub region_base: u64,
    /// `(cfg_type, offset, length)` of every capability in the region.
    pub capabilities: Vec<(u8, u32, u32)>,
    pub queues: Vec<VirtqueueSnapshot>,
    pub device_blob: Option<Vec<u8>>,
}

impl VirtioPciState {
    const TAG_DEVICE_STATUS: u16 = 1;
    const TAG_PREV_DEVICE_STATUS: u16 = 2;
    const TAG_DEVICE_FEATURES: u16 = 3;
    const TAG_DRIVER_FEATURES: u16 = 4;
    const TAG_DEVICE_FEATURE_SELECT: u16 = 5;
    const TAG_DRIVER_FEATURE_SELECT: u16 = 6;
    const TAG_CONFIG_GENERATION: u16 = 7;
    const TAG_GEN_UPDATE_PENDING: u16 = 8;
    const TAG_ISR: u16 = 9;
    const TAG_MSIX_CONFIG_VECTOR: u16 = 10;
    const TAG_QUEUE_SELECT: u16 = 11;
    const TAG_REGION_BASE: u16 = 12;
    const TAG_CAPABILITIES: u16 = 13;
    const TAG_QUEUES: u16 = 14;
    const TAG_DEVICE_BLOB: u16 = 15;
}

impl IoSnapshot for VirtioPciState {
    const DEVICE_ID: [u8; 4] = *b"VPCI";
    const DEVICE_VERSION: SnapshotVersion = SnapshotVersion::new(1, 0);

    fn save_state(&self) -> Vec<u8> {
        let mut w = SnapshotWriter::new(Self::DEVICE_ID, Self::DEVICE_VERSION);
        w.field_u8(Self::TAG_DEVICE_STATUS, self.device_status);
        w.field_u8(Self::TAG_PREV_DEVICE_STATUS, self.prev_device_status);
        w.field_u64(Self::TAG_DEVICE_FEATURES, self.device_features);
        w.field_u64(Self::TAG_DRIVER_FEATURES, self.driver_features);
        w.field_u32(Self::TAG_DEVICE_FEATURE_SELECT, self.device_feature_select);
        w.field_u32(Self::TAG_DRIVER_FEATURE_SELECT, self.driver_feature_select);
        w.field_u8(Self::TAG_CONFIG_GENERATION, self.config_generation);
        w.field_bool(Self::TAG_GEN_UPDATE_PENDING, self.gen_update_pending);
        w.field_u8(Self::TAG_ISR, self.isr);
        w.field_u16(Self::TAG_MSIX_CONFIG_VECTOR, self.msix_config_vector);
        w.field_u16(Self::TAG_QUEUE_SELECT, self.queue_select);
        w.field_u64(Self::TAG_REGION_BASE, self.region_base);

        let mut caps = Encoder::new().u32(self.capabilities.len() as u32);
        for (cfg_type, offset, length) in &self.capabilities {
            caps = caps.u8(*cfg_type).u32(*offset).u32(*length);
        }
        w.field_bytes(Self::TAG_CAPABILITIES, caps.finish());

        let mut queues = Encoder::new().u32(self.queues.len() as u32);
        for q in &self.queues {
            queues = queues
                .vec_u8(q.name.as_bytes())
                .u16(q.size)
                .bool(q.enabled)
                .u16(q.notify_off)
                .u16(q.msix_vector)
                .u64(q.desc_addr)
                .u64(q.avail_addr)
                .u64(q.used_addr)
                .u16(q.avail_idx_shadow)
                .u16(q.used_idx_shadow)
                .bool(q.used_event_reached);
        }
        w.field_bytes(Self::TAG_QUEUES, queues.finish());

        if let Some(blob) = &self.device_blob {
            w.field_bytes(Self::TAG_DEVICE_BLOB, blob.clone());
        }
        w.finish()
    }

    fn load_state(&mut self, bytes: &[u8]) -> SnapshotResult<()> {
        let r = SnapshotReader::parse(bytes, Self::DEVICE_ID)?;
        r.ensure_device_major(Self::DEVICE_VERSION.major)?;

        // Absent fields keep their defaults.
        *self = Self::default();
        if let Some(v) = r.u8(Self::TAG_DEVICE_STATUS)? {
            self.device_status = v;
        }
        if let Some(v) = r.u8(Self::TAG_PREV_DEVICE_STATUS)? {
            self.prev_device_status = v;
        }
        if let Some(v) = r.u64(Self::TAG_DEVICE_FEATURES)? {
            self.device_features = v;
        }
        if let Some(v) = r.u64(Self::TAG_DRIVER_FEATURES)? {
            self.driver_features = v;
        }
        if let Some(v) = r.u32(Self::TAG_DEVICE_FEATURE_SELECT)? {
            self.device_feature_select = v;
        }
        if let Some(v) = r.u32(Self::TAG_DRIVER_FEATURE_SELECT)? {
            self.driver_feature_select = v;
        }
        if let Some(v) = r.u8(Self::TAG_CONFIG_GENERATION)? {
            self.config_generation = v;
        }
        if let Some(v) = r.bool(Self::TAG_GEN_UPDATE_PENDING)? {
            self.gen_update_pending = v;
        }
        if let Some(v) = r.u8(Self::TAG_ISR)? {
            self.isr = v;
        }
        self.msix_config_vector = r
            .u16(Self::TAG_MSIX_CONFIG_VECTOR)?
            .unwrap_or(crate::spec::VIRTIO_MSI_NO_VECTOR);
        if let Some(v) = r.u16(Self::TAG_QUEUE_SELECT)? {
            self.queue_select = v;
        }
        if let Some(v) = r.u64(Self::TAG_REGION_BASE)? {
            self.region_base = v;
        }

        if let Some(buf) = r.bytes(Self::TAG_CAPABILITIES) {
            let mut d = Decoder::new(buf);
            let count = d.u32()? as usize;
            // Five capability kinds exist.
            if count > 5 {
                return Err(io_snapshot::SnapshotError::InvalidFieldEncoding("capability count"));
            }
            for _ in 0..count {
                self.capabilities.push((d.u8()?, d.u32()?, d.u32()?));
            }
            d.finish()?;
        }

        if let Some(buf) = r.bytes(Self::TAG_QUEUES) {
            let mut d = Decoder::new(buf);
            let count = d.u32()? as usize;
            if count > usize::from(VIRTQ_MAX_COUNT) {
                return Err(io_snapshot::SnapshotError::InvalidFieldEncoding("queue count"));
            }
            for _ in 0..count {
                let name = d.vec_u8(QUEUE_NAME_MAX_LEN, "queue name")?;
                let name = String::from_utf8(name.to_vec())
                    .map_err(|_| io_snapshot::SnapshotError::InvalidFieldEncoding("queue name"))?;
                self.queues.push(VirtqueueSnapshot {
                    name,
                    size: d.u16()?,
                    enabled: d.bool()?,
                    notify_off: d.u16()?,
                    msix_vector: d.u16()?,
                    desc_addr: d.u64()?,
                    avail_addr: d.u64()?,
                    used_addr: d.u64()?,
                    avail_idx_shadow: d.u16()?,
                    used_idx_shadow: d.u16()?,
                    used_event_reached: d.bool()?,
                });
            }
            d.finish()?;
        }

        if let Some(blob) = r.bytes(Self::TAG_DEVICE_BLOB) {
            if blob.len() > MAX_DEVICE_BLOB_LEN {
                return Err(io_snapshot::SnapshotError::InvalidFieldEncoding("device blob"));
            }
            self.device_blob = Some(blob.to_vec());
        }
        Ok(())
    }
}

impl VirtioPciDevice {
    /// Captures the transport state together with the backend's blob.
    pub fn save_state(&self) -> VirtioPciState {
        let device_blob = self.device.save_state();
        let state = self.state.lock();
        VirtioPciState {
            device_status: state.device_status.bits(),
            prev_device_status: state.prev_device_status.bits(),
            device_features: self.device_features,
            driver_features: state.driver_features,
            device_feature_select: state.device_feature_select,
            driver_feature_select: state.driver_feature_select,
            config_generation: state.config_generation,
            gen_update_pending: state.gen_update_pending,
            isr: state.interrupts.isr(),
            msix_config_vector: state.interrupts.msix_config_vector(),
            queue_select: state.queue_select,
            region_base: state.region_base,
            capabilities: self
                .layout
                .capabilities()
                .iter()
                .map(|c| (c.kind.cfg_type(), c.offset, c.length))
                .collect(),
            queues: state
                .queues
                .iter()
                .map(|q| VirtqueueSnapshot {
                    name: q.name.clone(),
                    size: q.size,
                    enabled: q.enabled,
                    notify_off: q.notify_off,
                    msix_vector: q.msix_vector,
                    desc_addr: q.desc_addr,
                    avail_addr: q.avail_addr,
                    used_addr: q.used_addr,
                    avail_idx_shadow: q.avail_shadow,
                    used_idx_shadow: q.used_shadow,
                    used_event_reached: q.used_event_reached,
                })
                .collect(),
            device_blob,
        }
    }

    /// Restores a state produced by [`VirtioPciDevice::save_state`] on an identically
    /// configured transport, then hands the backend its blob.
    pub fn restore_state(&self, saved: &VirtioPciState) -> Result<(), TransportError> {
        if saved.device_features != self.device_features {
            return Err(TransportError::SnapshotMismatch("device features differ"));
        }
        if saved.queues.len() != usize::from(self.options.num_queues) {
            return Err(TransportError::SnapshotMismatch("queue count differs"));
        }
        let layout_matches = saved.capabilities.len() == self.layout.capabilities().len()
            && saved
                .capabilities
                .iter()
                .zip(self.layout.capabilities())
                .all(|(&(cfg_type, offset, length), cap)| {
                    cfg_type == cap.kind.cfg_type() && offset == cap.offset && length == cap.length
                });
        if !layout_matches {
            return Err(TransportError::SnapshotMismatch("capability layout differs"));
        }
        if let Some(q) = saved.queues.iter().find(|q| {
            q.size == 0 || !q.size.is_power_of_two() || q.size > self.options.queue_max_size
        }) {
            tracing::warn!(queue = q.name.as_str(), size = q.size, "snapshot has an invalid queue size");
            return Err(TransportError::SnapshotMismatch("queue size out of range"));
        }

        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            state.device_status = DeviceStatus::from_bits_retain(saved.device_status);
            state.prev_device_status = DeviceStatus::from_bits_retain(saved.prev_device_status);
            state.driver_features = saved.driver_features;
            state.device_feature_select = saved.device_feature_select;
            state.driver_feature_select = saved.driver_feature_select;
            state.config_generation = saved.config_generation;
            state.gen_update_pending = saved.gen_update_pending;
            state.queue_select = saved.queue_select;
            state.interrupts.restore(saved.isr, saved.msix_config_vector);
            if state.region_base != saved.region_base {
                tracing::debug!(
                    saved = format_args!("{:#x}", saved.region_base),
                    current = format_args!("{:#x}", state.region_base),
                    "restored region base differs from the mapped one"
                );
            }
            state.region_base = saved.region_base;
            state.config_space = crate::pci::PciConfigSpace::new(
                self.device.device_type(),
                &self.layout,
                saved.region_base,
            );
            for (q, s) in state.queues.iter_mut().zip(&saved.queues) {
                q.name = s.name.clone();
                q.size = s.size;
                q.enabled = s.enabled;
                q.notify_off = s.notify_off;
                q.msix_vector = s.msix_vector;
                q.desc_addr = s.desc_addr;
                q.avail_addr = s.avail_addr;
                q.used_addr = s.used_addr;
                q.avail_shadow = s.avail_idx_shadow;
                q.used_shadow = s.used_idx_shadow;
                q.used_event_reached = s.used_event_reached;
            }
            state.device_cfg_shadow = vec![0; self.device_cfg_len as usize];
            self.device.read_config(0, &mut state.device_cfg_shadow);
        }

        if let Some(blob) = &saved.device_blob {
            self.device.load_state(blob)?;
        }
        self.device.load_done();
        tracing::debug!(
            status = saved.device_status,
            queues = saved.queues.iter().filter(|q| q.enabled).count(),
            "restored virtio-pci transport"
        );
        Ok(())
    }

    /// [`VirtioPciDevice::save_state`] encoded as a versioned snapshot.
    pub fn snapshot(&self) -> Vec<u8> {
        self.save_state().save_state()
    }

    pub fn restore_snapshot(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut saved = VirtioPciState::default();
        saved.load_state(bytes)?;
        self.restore_state(&saved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn state_survives_encoding() {
        let state = VirtioPciState {
            device_status: 0x0f,
            prev_device_status: 0x0f,
            device_features: 1 << 32,
            driver_features: 1 << 32,
            config_generation: 3,
            msix_config_vector: 0xffff,
            region_base: 0xfe00_0000,
            capabilities: vec![(1, 0, 0x38), (2, 0x38, 4), (3, 0x3c, 1)],
            queues: vec![VirtqueueSnapshot {
                name: "rx".into(),
                size: 256,
                enabled: true,
                msix_vector: 0xffff,
                desc_addr: 0x1000,
                avail_addr: 0x2000,
                used_addr: 0x3000,
                avail_idx_shadow: 7,
                used_idx_shadow: 5,
                ..Default::default()
            }],
            device_blob: Some(vec![1, 2, 3]),
            ..Default::default()
        };
        let bytes = state.save_state();
        let mut restored = VirtioPciState::default();
        restored.load_state(&bytes).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn oversized_queue_table_is_rejected() {
        let state = VirtioPciState {
            queues: vec![VirtqueueSnapshot::default(); 25],
            ..Default::default()
        };
        let bytes = state.save_state();
        let mut restored = VirtioPciState::default();
        assert!(restored.load_state(&bytes).is_err());
    }
}
