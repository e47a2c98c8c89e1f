#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;

use virtio_pci::memory::GuestRam;
use virtio_pci::spec::VIRTIO_F_VERSION_1;
use virtio_pci::{BumpRegionMapper, InterruptLog, VirtioDevice, VirtioPciDevice, VirtioPciOptions};

/// Bound the input so a single case can't make the decoder allocate without limit.
const MAX_INPUT_LEN: usize = 64 * 1024;

struct NullDevice;

impl VirtioDevice for NullDevice {
    fn device_type(&self) -> u16 {
        4
    }

    fn device_features(&self) -> u64 {
        VIRTIO_F_VERSION_1
    }

    fn config_len(&self) -> u32 {
        8
    }

    fn status_changed(&self, _driver_ok: bool) {}

    fn queue_notified(&self, _queue: u16) {}
}

fuzz_target!(|data: &[u8]| {
    if data.len() > MAX_INPUT_LEN {
        return;
    }

    let mut mapper = BumpRegionMapper::new(0xfe00_0000, 0x10_0000);
    let Ok(dev) = VirtioPciDevice::new(
        Arc::new(NullDevice),
        Arc::new(GuestRam::new(0x1000)),
        Box::new(InterruptLog::new()),
        &mut mapper,
        VirtioPciOptions {
            num_queues: 2,
            queue_max_size: 256,
            ..Default::default()
        },
    ) else {
        return;
    };

    if dev.restore_snapshot(data).is_ok() {
        // Anything accepted must survive another save/restore unchanged.
        let saved = dev.save_state();
        let bytes = dev.snapshot();
        dev.restore_snapshot(&bytes)
            .expect("re-restoring a freshly taken snapshot");
        assert_eq!(dev.save_state(), saved);
    }
});
