//! Placement of the virtio-pci capability structures inside the memory-mapped region.
//!
//! The layout is computed once at construction. Every capability starts at the end of the
//! previous one rounded up to the capability's alignment, in the fixed order common-config,
//! notify, ISR, device-specific (only when the device has configuration space).

use crate::spec::pci::{
    VIRTIO_PCI_CAP_COMMON_CFG, VIRTIO_PCI_CAP_DEVICE_CFG, VIRTIO_PCI_CAP_ISR_CFG,
    VIRTIO_PCI_CAP_NOTIFY_CFG, VIRTIO_PCI_CAP_PCI_CFG,
};
use crate::spec::{common_cfg, VIRTIO_NOTIFY_OFF_MULTIPLIER};

/// Granularity the mapped region is rounded up to.
pub const REGION_PAGE_SIZE: u64 = 0x1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    Common,
    Notify,
    Isr,
    Device,
    /// Alternate access window living in PCI configuration space only.
    PciCfg,
}

impl CapabilityKind {
    pub fn cfg_type(self) -> u8 {
        match self {
            CapabilityKind::Common => VIRTIO_PCI_CAP_COMMON_CFG,
            CapabilityKind::Notify => VIRTIO_PCI_CAP_NOTIFY_CFG,
            CapabilityKind::Isr => VIRTIO_PCI_CAP_ISR_CFG,
            CapabilityKind::Device => VIRTIO_PCI_CAP_DEVICE_CFG,
            CapabilityKind::PciCfg => VIRTIO_PCI_CAP_PCI_CFG,
        }
    }

    fn alignment(self) -> u32 {
        match self {
            // Doorbells are 16-bit registers.
            CapabilityKind::Notify => 2,
            _ => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityInfo {
    pub kind: CapabilityKind,
    pub bar: u8,
    pub offset: u32,
    pub length: u32,
}

impl CapabilityInfo {
    pub fn end(&self) -> u32 {
        self.offset + self.length
    }

    pub fn contains(&self, offset: u64) -> bool {
        offset >= u64::from(self.offset) && offset < u64::from(self.end())
    }
}

/// Accumulates `(kind, length)` entries and assigns aligned offsets.
#[derive(Debug, Clone)]
pub struct LayoutBuilder {
    bar: u8,
    next_offset: u32,
    caps: Vec<CapabilityInfo>,
}

impl LayoutBuilder {
    pub fn new(bar: u8) -> Self {
        Self {
            bar,
            next_offset: 0,
            caps: Vec::new(),
        }
    }

    pub fn push(mut self, kind: CapabilityKind, length: u32) -> Self {
        let align = kind.alignment();
        let offset = self.next_offset.next_multiple_of(align);
        self.caps.push(CapabilityInfo {
            kind,
            bar: self.bar,
            offset,
            length,
        });
        self.next_offset = offset + length;
        self
    }

    pub fn build(self) -> CapabilityLayout {
        let used = u64::from(self.next_offset).max(1);
        // BARs are power-of-two sized.
        let region_size = used.next_multiple_of(REGION_PAGE_SIZE).next_power_of_two();
        CapabilityLayout {
            bar: self.bar,
            caps: self.caps,
            region_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityLayout {
    bar: u8,
    caps: Vec<CapabilityInfo>,
    region_size: u64,
}

impl CapabilityLayout {
    /// Lays out the standard virtio-pci capability set for `num_queues` queues and a
    /// device-specific configuration block of `device_cfg_len` bytes.
    pub fn new(bar: u8, num_queues: u16, device_cfg_len: u32) -> Self {
        let notify_len = u32::from(num_queues) * VIRTIO_NOTIFY_OFF_MULTIPLIER;
        let mut builder = LayoutBuilder::new(bar)
            .push(CapabilityKind::Common, common_cfg::LEN)
            .push(CapabilityKind::Notify, notify_len)
            .push(CapabilityKind::Isr, 1);
        if device_cfg_len > 0 {
            builder = builder.push(CapabilityKind::Device, device_cfg_len);
        }
        builder.build()
    }

    pub fn bar(&self) -> u8 {
        self.bar
    }

    pub fn region_size(&self) -> u64 {
        self.region_size
    }

    pub fn capabilities(&self) -> &[CapabilityInfo] {
        &self.caps
    }

    pub fn get(&self, kind: CapabilityKind) -> Option<&CapabilityInfo> {
        self.caps.iter().find(|c| c.kind == kind)
    }

    /// Finds the capability covering `offset` and returns it with the offset relative to its
    /// start.
    pub fn locate(&self, offset: u64) -> Option<(CapabilityInfo, u64)> {
        self.caps
            .iter()
            .find(|c| c.contains(offset))
            .map(|c| (*c, offset - u64::from(c.offset)))
    }
}
