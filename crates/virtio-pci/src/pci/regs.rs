//! Decoding of guest accesses to the capability region.

use thiserror::Error;

use super::{DeviceEvent, TransportState, VirtioPciDevice};
use crate::layout::CapabilityKind;
use crate::queue::QueueState;
use crate::ratelimit::warn_guest;
use crate::spec::common_cfg::*;
use crate::spec::VIRTIO_NOTIFY_OFF_MULTIPLIER;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IoError {
    #[error("no register at region offset {offset:#x}")]
    InvalidRegister { offset: u64 },
    #[error("unsupported {len}-byte access at region offset {offset:#x}")]
    InvalidAccess { offset: u64, len: usize },
    #[error("feature select {0} is out of range")]
    SelectorOutOfRange(u32),
    #[error("queue select {0} is out of range")]
    InvalidQueue(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommonField {
    DeviceFeatureSelect,
    DeviceFeature,
    DriverFeatureSelect,
    DriverFeature,
    MsixConfig,
    NumQueues,
    DeviceStatus,
    ConfigGeneration,
    QueueSelect,
    QueueSize,
    QueueMsixVector,
    QueueEnable,
    QueueNotifyOff,
    QueueDesc,
    QueueDriver,
    QueueDevice,
}

/// `(offset, width, field)` for every register of `virtio_pci_common_cfg`.
const COMMON_FIELDS: [(u64, u64, CommonField); 16] = [
    (DEVICE_FEATURE_SELECT, 4, CommonField::DeviceFeatureSelect),
    (DEVICE_FEATURE, 4, CommonField::DeviceFeature),
    (DRIVER_FEATURE_SELECT, 4, CommonField::DriverFeatureSelect),
    (DRIVER_FEATURE, 4, CommonField::DriverFeature),
    (MSIX_CONFIG, 2, CommonField::MsixConfig),
    (NUM_QUEUES, 2, CommonField::NumQueues),
    (DEVICE_STATUS, 1, CommonField::DeviceStatus),
    (CONFIG_GENERATION, 1, CommonField::ConfigGeneration),
    (QUEUE_SELECT, 2, CommonField::QueueSelect),
    (QUEUE_SIZE, 2, CommonField::QueueSize),
    (QUEUE_MSIX_VECTOR, 2, CommonField::QueueMsixVector),
    (QUEUE_ENABLE, 2, CommonField::QueueEnable),
    (QUEUE_NOTIFY_OFF, 2, CommonField::QueueNotifyOff),
    (QUEUE_DESC, 8, CommonField::QueueDesc),
    (QUEUE_DRIVER, 8, CommonField::QueueDriver),
    (QUEUE_DEVICE, 8, CommonField::QueueDevice),
];

/// Finds the register fully containing `[offset, offset + len)`. Accesses straddling two
/// registers are not decoded.
fn common_field(offset: u64, len: usize) -> Option<(CommonField, usize)> {
    let end = offset.checked_add(len as u64)?;
    COMMON_FIELDS
        .iter()
        .find(|(start, width, _)| offset >= *start && end <= start + width)
        .map(|(start, _, field)| (*field, (offset - start) as usize))
}

fn select_half(value: u64, select: u32) -> Option<u64> {
    match select {
        0 => Some(value & 0xffff_ffff),
        1 => Some(value >> 32),
        _ => None,
    }
}

impl VirtioPciDevice {
    pub(super) fn read_locked(
        &self,
        state: &mut TransportState,
        offset: u64,
        data: &mut [u8],
    ) -> Result<(), IoError> {
        if !matches!(data.len(), 1 | 2 | 4 | 8) {
            return Err(IoError::InvalidAccess {
                offset,
                len: data.len(),
            });
        }
        let (cap, rel) = self
            .layout
            .locate(offset)
            .ok_or(IoError::InvalidRegister { offset })?;
        match cap.kind {
            CapabilityKind::Common => self.common_read(state, offset, rel, data),
            CapabilityKind::Isr => {
                // Only the first byte is defined; the rest of a wider read is zero.
                if rel == 0 {
                    data[0] = state.interrupts.read_isr_and_clear();
                }
                Ok(())
            }
            CapabilityKind::Device => {
                self.device_cfg_read(state, rel, data);
                Ok(())
            }
            // Doorbells are write-only.
            CapabilityKind::Notify => Ok(()),
            CapabilityKind::PciCfg => Err(IoError::InvalidRegister { offset }),
        }
    }

    pub(super) fn write_locked(
        &self,
        state: &mut TransportState,
        offset: u64,
        data: &[u8],
        events: &mut Vec<DeviceEvent>,
    ) -> Result<(), IoError> {
        if !matches!(data.len(), 1 | 2 | 4 | 8) {
            return Err(IoError::InvalidAccess {
                offset,
                len: data.len(),
            });
        }
        // Writes that hit no register are dropped.
        let Some((cap, rel)) = self.layout.locate(offset) else {
            tracing::trace!(offset, len = data.len(), "write outside every capability ignored");
            return Ok(());
        };
        match cap.kind {
            CapabilityKind::Common => self.common_write(state, offset, rel, data, events),
            CapabilityKind::Notify => self.notify_write(offset, rel, data, events),
            CapabilityKind::Device => {
                if rel + data.len() as u64 > u64::from(cap.length) {
                    return Err(IoError::InvalidAccess {
                        offset,
                        len: data.len(),
                    });
                }
                self.device.write_config(rel, data);
                Ok(())
            }
            // ISR is read-to-clear only.
            CapabilityKind::Isr | CapabilityKind::PciCfg => Ok(()),
        }
    }

    fn selected_queue<'s>(&self, state: &'s TransportState) -> Result<&'s QueueState, IoError> {
        let select = state.queue_select;
        state.queues.get(usize::from(select)).ok_or_else(|| {
            warn_guest!(self.warnings.queue_select, select, "queue select out of range");
            IoError::InvalidQueue(select)
        })
    }

    /// The current value of a common-config register, as a driver read would see it.
    fn common_value(&self, state: &TransportState, field: CommonField) -> Result<u64, IoError> {
        let value = match field {
            CommonField::DeviceFeatureSelect => u64::from(state.device_feature_select),
            CommonField::DeviceFeature => {
                let select = state.device_feature_select;
                select_half(self.device_features, select).ok_or_else(|| {
                    warn_guest!(self.warnings.feature_select, select, "device feature select out of range");
                    IoError::SelectorOutOfRange(select)
                })?
            }
            CommonField::DriverFeatureSelect => u64::from(state.driver_feature_select),
            CommonField::DriverFeature => {
                let select = state.driver_feature_select;
                select_half(state.driver_features, select).ok_or_else(|| {
                    warn_guest!(self.warnings.feature_select, select, "driver feature select out of range");
                    IoError::SelectorOutOfRange(select)
                })?
            }
            CommonField::MsixConfig => u64::from(state.interrupts.msix_config_vector()),
            CommonField::NumQueues => u64::from(self.options.num_queues),
            CommonField::DeviceStatus => u64::from(state.device_status.bits()),
            CommonField::ConfigGeneration => u64::from(state.config_generation),
            CommonField::QueueSelect => u64::from(state.queue_select),
            CommonField::QueueSize => u64::from(self.selected_queue(state)?.size),
            CommonField::QueueMsixVector => u64::from(self.selected_queue(state)?.msix_vector),
            CommonField::QueueEnable => u64::from(self.selected_queue(state)?.enabled),
            CommonField::QueueNotifyOff => u64::from(self.selected_queue(state)?.notify_off),
            CommonField::QueueDesc => self.selected_queue(state)?.desc_addr,
            CommonField::QueueDriver => self.selected_queue(state)?.avail_addr,
            CommonField::QueueDevice => self.selected_queue(state)?.used_addr,
        };
        Ok(value)
    }

    fn common_read(
        &self,
        state: &mut TransportState,
        offset: u64,
        rel: u64,
        data: &mut [u8],
    ) -> Result<(), IoError> {
        let (field, at) = common_field(rel, data.len()).ok_or(IoError::InvalidAccess {
            offset,
            len: data.len(),
        })?;
        let value = self.common_value(state, field)?.to_le_bytes();
        data.copy_from_slice(&value[at..at + data.len()]);
        Ok(())
    }

    fn common_write(
        &self,
        state: &mut TransportState,
        offset: u64,
        rel: u64,
        data: &[u8],
        events: &mut Vec<DeviceEvent>,
    ) -> Result<(), IoError> {
        let (field, at) = common_field(rel, data.len()).ok_or(IoError::InvalidAccess {
            offset,
            len: data.len(),
        })?;
        if matches!(
            field,
            CommonField::DeviceFeature
                | CommonField::NumQueues
                | CommonField::ConfigGeneration
                | CommonField::QueueNotifyOff
        ) {
            tracing::trace!(?field, "write to read-only register ignored");
            return Ok(());
        }

        // Narrow accesses update part of the register.
        let mut bytes = self.common_value(state, field)?.to_le_bytes();
        bytes[at..at + data.len()].copy_from_slice(data);
        let value = u64::from_le_bytes(bytes);

        match field {
            CommonField::DeviceFeatureSelect => state.device_feature_select = value as u32,
            CommonField::DriverFeatureSelect => state.driver_feature_select = value as u32,
            CommonField::DriverFeature => {
                // `common_value` already rejected selects other than 0 and 1.
                state.driver_features = if state.driver_feature_select == 0 {
                    (state.driver_features & !0xffff_ffff) | (value & 0xffff_ffff)
                } else {
                    (state.driver_features & 0xffff_ffff) | (value << 32)
                };
                let unsupported = state.driver_features & !self.device_features;
                if unsupported != 0 {
                    tracing::debug!(
                        unsupported = format_args!("{unsupported:#x}"),
                        "driver acknowledged features the device did not offer"
                    );
                }
            }
            CommonField::MsixConfig => state.interrupts.set_msix_config_vector(value as u16),
            CommonField::DeviceStatus => self.write_status(state, value as u8, events),
            CommonField::QueueSelect => state.queue_select = value as u16,
            CommonField::QueueSize => {
                let size = value as u16;
                let max = self.options.queue_max_size;
                let q = self.selected_queue_mut(state)?;
                if size == 0 || size > max || !size.is_power_of_two() {
                    tracing::debug!(size, max, "invalid queue size ignored");
                } else {
                    q.size = size;
                }
            }
            CommonField::QueueMsixVector => self.selected_queue_mut(state)?.msix_vector = value as u16,
            CommonField::QueueEnable => {
                let q = self.selected_queue_mut(state)?;
                q.enabled = value != 0;
                tracing::debug!(
                    queue = q.name.as_str(),
                    enabled = q.enabled,
                    size = q.size,
                    desc = format_args!("{:#x}", q.desc_addr),
                    avail = format_args!("{:#x}", q.avail_addr),
                    used = format_args!("{:#x}", q.used_addr),
                    "queue enable"
                );
            }
            CommonField::QueueDesc => self.selected_queue_mut(state)?.desc_addr = value,
            CommonField::QueueDriver => self.selected_queue_mut(state)?.avail_addr = value,
            CommonField::QueueDevice => self.selected_queue_mut(state)?.used_addr = value,
            CommonField::DeviceFeature
            | CommonField::NumQueues
            | CommonField::ConfigGeneration
            | CommonField::QueueNotifyOff => {}
        }
        Ok(())
    }

    fn selected_queue_mut<'s>(
        &self,
        state: &'s mut TransportState,
    ) -> Result<&'s mut QueueState, IoError> {
        let select = state.queue_select;
        state
            .queues
            .get_mut(usize::from(select))
            .ok_or(IoError::InvalidQueue(select))
    }

    fn notify_write(
        &self,
        offset: u64,
        rel: u64,
        data: &[u8],
        events: &mut Vec<DeviceEvent>,
    ) -> Result<(), IoError> {
        let multiplier = u64::from(VIRTIO_NOTIFY_OFF_MULTIPLIER);
        if rel % multiplier != 0 {
            return Err(IoError::InvalidAccess {
                offset,
                len: data.len(),
            });
        }
        let queue = (rel / multiplier) as u16;
        if queue >= self.options.num_queues {
            warn_guest!(self.warnings.queue_select, queue, "doorbell for a nonexistent queue");
            return Ok(());
        }
        let mut value = [0u8; 2];
        let n = data.len().min(2);
        value[..n].copy_from_slice(&data[..n]);
        let value = u16::from_le_bytes(value);
        if value != queue {
            tracing::debug!(queue, value, "doorbell value does not match the queue");
        }
        tracing::trace!(queue, "queue notified");
        events.push(DeviceEvent::QueueNotified(queue));
        Ok(())
    }

    /// Serves a read of the device-specific block and maintains the configuration generation:
    /// if the block changed since the last read, or the host announced a change, the generation
    /// moves on.
    fn device_cfg_read(&self, state: &mut TransportState, rel: u64, data: &mut [u8]) {
        let mut block = vec![0u8; self.device_cfg_len as usize];
        self.device.read_config(0, &mut block);

        let start = rel as usize;
        if start < block.len() {
            let n = data.len().min(block.len() - start);
            data[..n].copy_from_slice(&block[start..start + n]);
        }

        if state.gen_update_pending || block != state.device_cfg_shadow {
            state.config_generation = state.config_generation.wrapping_add(1);
            state.device_cfg_shadow = block;
            state.gen_update_pending = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_fields_cover_the_structure_without_gaps() {
        let mut next = 0;
        for (offset, width, _) in COMMON_FIELDS {
            assert_eq!(offset, next);
            next = offset + width;
        }
        assert_eq!(next, u64::from(LEN));
    }

    #[test]
    fn straddling_accesses_are_not_decoded() {
        assert_eq!(common_field(QUEUE_DESC + 4, 4), Some((CommonField::QueueDesc, 4)));
        assert_eq!(common_field(DEVICE_STATUS, 2), None);
        assert_eq!(common_field(NUM_QUEUES, 1), Some((CommonField::NumQueues, 0)));
    }
}
