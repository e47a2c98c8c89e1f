//! Constants and binary layouts defined by the VirtIO 1.0 specification.

use bitflags::bitflags;

pub const PCI_VENDOR_ID_VIRTIO: u16 = 0x1af4;

/// Modern virtio-pci device IDs: `0x1040 + <virtio device id>`.
pub const VIRTIO_PCI_DEVICE_ID_BASE: u16 = 0x1040;

// Feature bits shared by all device types.
pub const VIRTIO_F_RING_INDIRECT_DESC: u64 = 1 << 28;
pub const VIRTIO_F_RING_EVENT_IDX: u64 = 1 << 29;
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

bitflags! {
    /// The device status byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DeviceStatus: u8 {
        const ACKNOWLEDGE = 0x01;
        const DRIVER = 0x02;
        const DRIVER_OK = 0x04;
        const FEATURES_OK = 0x08;
        const DEVICE_NEEDS_RESET = 0x40;
        const FAILED = 0x80;
    }
}

// Interrupt status (ISR) bits.
pub const VIRTIO_ISR_QUEUE: u8 = 0x01;
pub const VIRTIO_ISR_CONFIG: u8 = 0x02;

/// "No MSI-X vector assigned".
pub const VIRTIO_MSI_NO_VECTOR: u16 = 0xffff;

/// Number of queue slots a transport instance can expose.
pub const VIRTQ_MAX_COUNT: u16 = 24;

/// Largest ring a queue may be configured with; also bounds the length of one descriptor chain.
pub const VIRTQ_MAX_SIZE: u16 = 1024;

/// Stride between queue doorbells in the notify capability (`notify_off_multiplier`).
pub const VIRTIO_NOTIFY_OFF_MULTIPLIER: u32 = 2;

/// virtio-pci capability structures (vendor-specific PCI capabilities).
pub mod pci {
    pub const PCI_CAP_ID_VENDOR_SPECIFIC: u8 = 0x09;

    pub const VIRTIO_PCI_CAP_COMMON_CFG: u8 = 1;
    pub const VIRTIO_PCI_CAP_NOTIFY_CFG: u8 = 2;
    pub const VIRTIO_PCI_CAP_ISR_CFG: u8 = 3;
    pub const VIRTIO_PCI_CAP_DEVICE_CFG: u8 = 4;
    pub const VIRTIO_PCI_CAP_PCI_CFG: u8 = 5;

    /*
    struct virtio_pci_cap {
        u8 cap_vndr;
        u8 cap_next;
        u8 cap_len;
        u8 cfg_type;
        u8 bar;
        u8 padding[3];
        le32 offset;
        le32 length;
    };
    */
    pub const CAP_OFFSET_LEN: usize = 2;
    pub const CAP_OFFSET_CFG_TYPE: usize = 3;
    pub const CAP_OFFSET_BAR: usize = 4;
    pub const CAP_OFFSET_OFFSET: usize = 8;
    pub const CAP_OFFSET_LENGTH: usize = 12;
    pub const CAP_LEN: u8 = 16;

    /// `struct virtio_pci_notify_cap { virtio_pci_cap cap; le32 notify_off_multiplier; }`
    pub const NOTIFY_CAP_OFFSET_MULTIPLIER: usize = 16;
    pub const NOTIFY_CAP_LEN: u8 = 20;

    /// `struct virtio_pci_cfg_cap { virtio_pci_cap cap; u8 pci_cfg_data[4]; }`
    pub const PCI_CFG_CAP_OFFSET_DATA: usize = 16;
    pub const PCI_CFG_CAP_LEN: u8 = 20;
}

/// `struct virtio_pci_common_cfg` field offsets.
pub mod common_cfg {
    pub const DEVICE_FEATURE_SELECT: u64 = 0x00; // le32
    pub const DEVICE_FEATURE: u64 = 0x04; // le32, read-only
    pub const DRIVER_FEATURE_SELECT: u64 = 0x08; // le32
    pub const DRIVER_FEATURE: u64 = 0x0c; // le32
    pub const MSIX_CONFIG: u64 = 0x10; // le16
    pub const NUM_QUEUES: u64 = 0x12; // le16, read-only
    pub const DEVICE_STATUS: u64 = 0x14; // u8
    pub const CONFIG_GENERATION: u64 = 0x15; // u8, read-only
    pub const QUEUE_SELECT: u64 = 0x16; // le16
    pub const QUEUE_SIZE: u64 = 0x18; // le16
    pub const QUEUE_MSIX_VECTOR: u64 = 0x1a; // le16
    pub const QUEUE_ENABLE: u64 = 0x1c; // le16
    pub const QUEUE_NOTIFY_OFF: u64 = 0x1e; // le16, read-only
    pub const QUEUE_DESC: u64 = 0x20; // le64
    pub const QUEUE_DRIVER: u64 = 0x28; // le64
    pub const QUEUE_DEVICE: u64 = 0x30; // le64

    pub const LEN: u32 = 0x38;
}

/// Split virtqueue definitions.
pub mod queue {
    use bitflags::bitflags;

    /*
    struct virtq_desc {
        le64 addr;
        le32 len;
        le16 flags;
        le16 next;
    };
    */
    pub const DESCRIPTOR_SIZE: u64 = 16;

    bitflags! {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct DescriptorFlags: u16 {
            const NEXT = 1;
            const WRITE = 2;
            const INDIRECT = 4;
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Descriptor {
        pub addr: u64,
        pub len: u32,
        pub flags: DescriptorFlags,
        pub next: u16,
    }

    impl Descriptor {
        pub fn from_le_bytes(b: [u8; 16]) -> Self {
            let mut addr = [0u8; 8];
            addr.copy_from_slice(&b[0..8]);
            Self {
                addr: u64::from_le_bytes(addr),
                len: u32::from_le_bytes([b[8], b[9], b[10], b[11]]),
                flags: DescriptorFlags::from_bits_retain(u16::from_le_bytes([b[12], b[13]])),
                next: u16::from_le_bytes([b[14], b[15]]),
            }
        }

        pub fn has_next(&self) -> bool {
            self.flags.contains(DescriptorFlags::NEXT)
        }

        pub fn is_device_writable(&self) -> bool {
            self.flags.contains(DescriptorFlags::WRITE)
        }
    }

    /*
    struct virtq_avail {
        le16 flags;
        le16 idx;
        le16 ring[ /* Queue Size */ ];
        le16 used_event;
    };
    */
    pub const AVAIL_OFFSET_FLAGS: u64 = 0;
    pub const AVAIL_OFFSET_IDX: u64 = 2;
    pub const AVAIL_OFFSET_RING: u64 = 4;
    pub const AVAIL_ELEMENT_SIZE: u64 = 2;

    pub fn avail_offset_used_event(queue_size: u16) -> u64 {
        AVAIL_OFFSET_RING + AVAIL_ELEMENT_SIZE * u64::from(queue_size)
    }

    bitflags! {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct AvailFlags: u16 {
            const NO_INTERRUPT = 1;
        }
    }

    /*
    struct virtq_used {
        le16 flags;
        le16 idx;
        struct virtq_used_elem ring[ /* Queue Size */];
        le16 avail_event;
    };
    struct virtq_used_elem {
        le32 id;
        le32 len;
    };
    */
    pub const USED_OFFSET_FLAGS: u64 = 0;
    pub const USED_OFFSET_IDX: u64 = 2;
    pub const USED_OFFSET_RING: u64 = 4;
    pub const USED_ELEMENT_SIZE: u64 = 8;

    pub fn used_offset_avail_event(queue_size: u16) -> u64 {
        USED_OFFSET_RING + USED_ELEMENT_SIZE * u64::from(queue_size)
    }

    bitflags! {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct UsedFlags: u16 {
            const NO_NOTIFY = 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::queue::*;

    #[test]
    fn descriptor_decodes_little_endian_fields() {
        let mut raw = [0u8; 16];
        raw[0..8].copy_from_slice(&0x1122_3344_5566_7788u64.to_le_bytes());
        raw[8..12].copy_from_slice(&512u32.to_le_bytes());
        raw[12..14].copy_from_slice(&(DescriptorFlags::NEXT | DescriptorFlags::WRITE).bits().to_le_bytes());
        raw[14..16].copy_from_slice(&3u16.to_le_bytes());

        let desc = Descriptor::from_le_bytes(raw);
        assert_eq!(desc.addr, 0x1122_3344_5566_7788);
        assert_eq!(desc.len, 512);
        assert!(desc.has_next());
        assert!(desc.is_device_writable());
        assert_eq!(desc.next, 3);
    }

    #[test]
    fn ring_trailer_offsets() {
        assert_eq!(avail_offset_used_event(4), 12);
        assert_eq!(used_offset_avail_event(4), 36);
    }
}
