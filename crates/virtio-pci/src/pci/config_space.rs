//! The 256-byte PCI configuration header and the virtio vendor capability chain.

use crate::layout::{CapabilityKind, CapabilityLayout};
use crate::spec::pci::{
    CAP_LEN, CAP_OFFSET_BAR, CAP_OFFSET_CFG_TYPE, CAP_OFFSET_LEN, CAP_OFFSET_LENGTH,
    CAP_OFFSET_OFFSET, NOTIFY_CAP_LEN, NOTIFY_CAP_OFFSET_MULTIPLIER, PCI_CAP_ID_VENDOR_SPECIFIC,
    PCI_CFG_CAP_LEN, PCI_CFG_CAP_OFFSET_DATA,
};
use crate::spec::{PCI_VENDOR_ID_VIRTIO, VIRTIO_NOTIFY_OFF_MULTIPLIER, VIRTIO_PCI_DEVICE_ID_BASE};

pub const PCI_CONFIG_SPACE_SIZE: usize = 256;

/// First capability in the chain.
pub const CAP_BASE: u8 = 0x40;

const PCI_COMMAND: usize = 0x04;
const PCI_STATUS: usize = 0x06;
const PCI_STATUS_CAP_LIST: u16 = 1 << 4;
const PCI_BAR0: usize = 0x10;
const PCI_CAP_PTR: usize = 0x34;
const PCI_INTERRUPT_LINE: usize = 0x3c;
const PCI_INTERRUPT_PIN: usize = 0x3d;

/// 64-bit, non-prefetchable memory BAR.
const BAR_MEM_TYPE_64: u32 = 0b100;

/// Where a VIRTIO_PCI_CAP_PCI_CFG access should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PciCfgWindow {
    pub bar: u8,
    pub offset: u32,
    pub length: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct PciConfigSpace {
    bytes: [u8; PCI_CONFIG_SPACE_SIZE],
    pci_cfg_cap: usize,
}

/// PCI (class, subclass) for a virtio device type.
fn class_code(device_type: u16) -> (u8, u8) {
    match device_type {
        // Network controller / Ethernet controller.
        1 => (0x02, 0x00),
        // Mass storage / SCSI.
        2 => (0x01, 0x00),
        // Simple communication controller / other (console).
        3 => (0x07, 0x80),
        // Display controller / other (gpu).
        16 => (0x03, 0x80),
        // Input device controller / other.
        18 => (0x09, 0x80),
        // Multimedia / audio device.
        25 => (0x04, 0x01),
        _ => (0x00, 0x00),
    }
}

impl PciConfigSpace {
    pub fn new(device_type: u16, layout: &CapabilityLayout, region_base: u64) -> Self {
        let mut b = [0u8; PCI_CONFIG_SPACE_SIZE];
        b[0..2].copy_from_slice(&PCI_VENDOR_ID_VIRTIO.to_le_bytes());
        let device_id = VIRTIO_PCI_DEVICE_ID_BASE.wrapping_add(device_type);
        b[2..4].copy_from_slice(&device_id.to_le_bytes());
        b[PCI_STATUS..PCI_STATUS + 2].copy_from_slice(&PCI_STATUS_CAP_LIST.to_le_bytes());

        b[0x08] = 0x01; // revision: modern-only device
        let (class, subclass) = class_code(device_type);
        b[0x0a] = subclass;
        b[0x0b] = class;

        let bar = PCI_BAR0 + 4 * usize::from(layout.bar());
        let low = (region_base as u32 & !0xf) | BAR_MEM_TYPE_64;
        b[bar..bar + 4].copy_from_slice(&low.to_le_bytes());
        b[bar + 4..bar + 8].copy_from_slice(&((region_base >> 32) as u32).to_le_bytes());

        b[0x2c..0x2e].copy_from_slice(&PCI_VENDOR_ID_VIRTIO.to_le_bytes());
        b[0x2e..0x30].copy_from_slice(&device_type.to_le_bytes());
        b[PCI_INTERRUPT_PIN] = 0x01; // INTA#
        b[PCI_CAP_PTR] = CAP_BASE;

        let mut next = usize::from(CAP_BASE);
        for cap in layout.capabilities() {
            let len = if cap.kind == CapabilityKind::Notify {
                NOTIFY_CAP_LEN
            } else {
                CAP_LEN
            };
            let at = next;
            next += usize::from(len);
            write_cap(&mut b, at, next, len, cap.kind.cfg_type(), cap.bar, cap.offset, cap.length);
            if cap.kind == CapabilityKind::Notify {
                b[at + NOTIFY_CAP_OFFSET_MULTIPLIER..at + NOTIFY_CAP_OFFSET_MULTIPLIER + 4]
                    .copy_from_slice(&VIRTIO_NOTIFY_OFF_MULTIPLIER.to_le_bytes());
            }
        }

        // The alternate access window terminates the chain; the driver programs bar, offset
        // and length itself.
        let pci_cfg_cap = next;
        write_cap(
            &mut b,
            pci_cfg_cap,
            0,
            PCI_CFG_CAP_LEN,
            CapabilityKind::PciCfg.cfg_type(),
            0,
            0,
            0,
        );

        Self {
            bytes: b,
            pci_cfg_cap,
        }
    }

    pub fn bytes(&self) -> &[u8; PCI_CONFIG_SPACE_SIZE] {
        &self.bytes
    }

    pub fn read(&self, offset: usize, data: &mut [u8]) {
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = self.bytes.get(offset + i).copied().unwrap_or(0);
        }
    }

    /// Byte range of the `pci_cfg_data` window.
    pub fn pci_cfg_data_range(&self) -> std::ops::Range<usize> {
        let start = self.pci_cfg_cap + PCI_CFG_CAP_OFFSET_DATA;
        start..start + 4
    }

    pub fn pci_cfg_window(&self) -> PciCfgWindow {
        let at = self.pci_cfg_cap;
        let u32_at = |off: usize| {
            u32::from_le_bytes([
                self.bytes[at + off],
                self.bytes[at + off + 1],
                self.bytes[at + off + 2],
                self.bytes[at + off + 3],
            ])
        };
        PciCfgWindow {
            bar: self.bytes[at + CAP_OFFSET_BAR],
            offset: u32_at(CAP_OFFSET_OFFSET),
            length: u32_at(CAP_OFFSET_LENGTH),
        }
    }

    /// Applies a write to the driver-writable parts of the header: the command register, the
    /// interrupt line and the `bar`/`offset`/`length` fields of the PCI_CFG capability. Other
    /// bytes are read-only.
    pub fn write(&mut self, offset: usize, data: &[u8]) {
        let cap = self.pci_cfg_cap;
        let writable = |o: usize| {
            (PCI_COMMAND..PCI_COMMAND + 2).contains(&o)
                || o == PCI_INTERRUPT_LINE
                || o == cap + CAP_OFFSET_BAR
                || (cap + CAP_OFFSET_OFFSET..cap + PCI_CFG_CAP_OFFSET_DATA).contains(&o)
        };
        for (i, &byte) in data.iter().enumerate() {
            let o = offset + i;
            if o < PCI_CONFIG_SPACE_SIZE && writable(o) {
                self.bytes[o] = byte;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn write_cap(
    b: &mut [u8; PCI_CONFIG_SPACE_SIZE],
    at: usize,
    next: usize,
    cap_len: u8,
    cfg_type: u8,
    bar: u8,
    offset: u32,
    length: u32,
) {
    b[at] = PCI_CAP_ID_VENDOR_SPECIFIC;
    b[at + 1] = next as u8;
    b[at + CAP_OFFSET_LEN] = cap_len;
    b[at + CAP_OFFSET_CFG_TYPE] = cfg_type;
    b[at + CAP_OFFSET_BAR] = bar;
    b[at + CAP_OFFSET_OFFSET..at + CAP_OFFSET_OFFSET + 4].copy_from_slice(&offset.to_le_bytes());
    b[at + CAP_OFFSET_LENGTH..at + CAP_OFFSET_LENGTH + 4].copy_from_slice(&length.to_le_bytes());
}
