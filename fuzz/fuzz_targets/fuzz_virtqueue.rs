#![no_main]

use std::sync::Arc;

use arbitrary::Unstructured;
use libfuzzer_sys::fuzz_target;

use virtio_pci::layout::CapabilityKind;
use virtio_pci::memory::{write_u16_le, GuestRam};
use virtio_pci::spec::{
    common_cfg, DeviceStatus, VIRTIO_F_RING_EVENT_IDX, VIRTIO_F_VERSION_1,
};
use virtio_pci::{BumpRegionMapper, InterruptLog, VirtioDevice, VirtioPciDevice, VirtioPciOptions};

const MAX_INPUT_LEN: usize = 8192;
const RAM_SIZE: usize = 64 * 1024;
const MAX_STEPS: usize = 64;

// Fixed split-ring layout; the fuzzer controls everything inside it.
const QUEUE_SIZE: u16 = 16;
const DESC_ADDR: u64 = 0x1000;
const AVAIL_ADDR: u64 = 0x2000;
const USED_ADDR: u64 = 0x3000;

struct NullDevice;

impl VirtioDevice for NullDevice {
    fn device_type(&self) -> u16 {
        3
    }

    fn device_features(&self) -> u64 {
        VIRTIO_F_VERSION_1 | VIRTIO_F_RING_EVENT_IDX
    }

    fn status_changed(&self, _driver_ok: bool) {}

    fn queue_notified(&self, _queue: u16) {}
}

fn common_write(dev: &VirtioPciDevice, base: u64, reg: u64, bytes: &[u8]) {
    let _ = dev.mmio_write(base + reg, bytes);
}

fuzz_target!(|data: &[u8]| {
    let data = &data[..data.len().min(MAX_INPUT_LEN)];
    let mut u = Unstructured::new(data);

    let event_idx: bool = u.arbitrary().unwrap_or(false);
    let avail_idx: u16 = u.arbitrary().unwrap_or(1);
    let steps: Vec<u8> = (0..u.int_in_range(0..=MAX_STEPS).unwrap_or(0))
        .map(|_| u.arbitrary().unwrap_or(0))
        .collect();

    // Seed guest RAM (rings included) from the rest of the input.
    let mem = Arc::new(GuestRam::new(RAM_SIZE));
    let init_len = u.len();
    mem.fill_from(u.bytes(init_len).unwrap_or(&[]));
    let _ = write_u16_le(&*mem, AVAIL_ADDR + 2, avail_idx);
    let _ = write_u16_le(&*mem, USED_ADDR + 2, 0);

    let mut mapper = BumpRegionMapper::new(0xfe00_0000, 0x10_0000);
    let Ok(dev) = VirtioPciDevice::new(
        Arc::new(NullDevice),
        mem,
        Box::new(InterruptLog::new()),
        &mut mapper,
        VirtioPciOptions {
            num_queues: 1,
            queue_max_size: QUEUE_SIZE,
            ..Default::default()
        },
    ) else {
        return;
    };
    let Some(common) = dev.layout().get(CapabilityKind::Common).map(|c| u64::from(c.offset))
    else {
        return;
    };

    // Drive the device to DRIVER_OK with one enabled queue.
    let features = if event_idx {
        VIRTIO_F_VERSION_1 | VIRTIO_F_RING_EVENT_IDX
    } else {
        VIRTIO_F_VERSION_1
    };
    common_write(&dev, common, common_cfg::DRIVER_FEATURE_SELECT, &0u32.to_le_bytes());
    common_write(&dev, common, common_cfg::DRIVER_FEATURE, &(features as u32).to_le_bytes());
    common_write(&dev, common, common_cfg::DRIVER_FEATURE_SELECT, &1u32.to_le_bytes());
    common_write(&dev, common, common_cfg::DRIVER_FEATURE, &((features >> 32) as u32).to_le_bytes());
    common_write(&dev, common, common_cfg::QUEUE_DESC, &DESC_ADDR.to_le_bytes());
    common_write(&dev, common, common_cfg::QUEUE_DRIVER, &AVAIL_ADDR.to_le_bytes());
    common_write(&dev, common, common_cfg::QUEUE_DEVICE, &USED_ADDR.to_le_bytes());
    common_write(&dev, common, common_cfg::QUEUE_ENABLE, &1u16.to_le_bytes());
    let status = DeviceStatus::ACKNOWLEDGE
        | DeviceStatus::DRIVER
        | DeviceStatus::FEATURES_OK
        | DeviceStatus::DRIVER_OK;
    common_write(&dev, common, common_cfg::DEVICE_STATUS, &[status.bits()]);

    let mut held = Vec::new();
    for step in steps {
        match step % 6 {
            0 | 1 => {
                if let Ok(Some(chain)) = dev.get(0) {
                    assert!(chain.in_segments().len() <= usize::from(QUEUE_SIZE));
                    held.push(chain);
                }
            }
            2 => {
                let _ = dev.peek(0);
            }
            3 => {
                let _ = dev.skip(0);
            }
            4 => {
                if let Some(chain) = held.pop() {
                    let reply = vec![step; chain.in_len().min(512) as usize];
                    let written = dev.put(0, &[&reply[..]], chain);
                    if let Ok(written) = written {
                        assert_eq!(written as usize, reply.len());
                    }
                }
            }
            _ => {
                let _ = dev.sync(0);
                let _ = dev.enable_notify(0, step & 0x80 != 0);
            }
        }
        if let Ok(count) = dev.available_count(0) {
            assert!(count <= QUEUE_SIZE);
        }
    }
});
