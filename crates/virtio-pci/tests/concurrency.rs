mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use common::{harness, small_options, Event};
use pretty_assertions::assert_eq;
use virtio_pci::memory::GuestMemory;
use virtio_pci::spec::queue::DescriptorFlags;
use virtio_pci::spec::{common_cfg, DeviceStatus, VIRTIO_F_VERSION_1};
use virtio_pci::VirtioPciOptions;

const BUF: u64 = 0x20000;

#[test]
fn doorbell_callbacks_can_reenter_the_transport() {
    let h = harness(VIRTIO_F_VERSION_1, Vec::new(), small_options());
    h.device.transport.set(Arc::downgrade(&h.dev)).unwrap();
    h.start(0, 16);

    for i in 0..3u16 {
        h.write_desc(0, i, BUF + u64::from(i) * 0x10, 0x10, DescriptorFlags::WRITE, 0);
        h.push_avail(0, 16, i, i);
    }
    h.ring_doorbell(0);

    assert_eq!(h.device.events(), vec![Event::Status(true), Event::Notified(0)]);
    assert_eq!(h.device.serviced.load(Ordering::Relaxed), 3);
    assert_eq!(h.used_idx(0), 3);
    assert_eq!(h.used_elem(0, 2), (2, 0));
    assert!(h.irqs.line_asserted());
}

#[test]
fn guest_and_worker_threads_share_the_transport() {
    const REQUESTS: u16 = 200;
    const SIZE: u16 = 256;

    let h = harness(
        VIRTIO_F_VERSION_1,
        vec![0x5a; 8],
        VirtioPciOptions {
            queue_max_size: SIZE,
            ..small_options()
        },
    );
    h.start(0, SIZE);
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        // The driver posts requests one at a time and rings the doorbell after each.
        s.spawn(|| {
            for i in 0..REQUESTS {
                let addr = BUF + u64::from(i) * 4;
                h.write_desc(0, i, addr, 4, DescriptorFlags::WRITE, 0);
                h.push_avail(0, SIZE, i, i);
                h.ring_doorbell(0);
            }
        });

        // Other vCPUs poke at registers in the meantime.
        for _ in 0..2 {
            s.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    assert!(h.status().contains(DeviceStatus::DRIVER_OK));
                    assert_eq!(h.device_cfg_read(0, 4), vec![0x5a; 4]);
                    assert_eq!(h.read16(common_cfg::NUM_QUEUES), 2);
                    let _ = h.read_isr();
                }
            });
        }

        // The backend worker completes every request with its index.
        s.spawn(|| {
            let mut completed = 0u16;
            while completed < REQUESTS {
                match h.dev.get(0).unwrap() {
                    Some(chain) => {
                        let id = u32::from(chain.head_index());
                        let written = h.dev.put(0, &[&id.to_le_bytes()[..]], chain).unwrap();
                        assert_eq!(written, 4);
                        h.dev.sync(0).unwrap();
                        completed += 1;
                    }
                    None => thread::yield_now(),
                }
            }
            done.store(true, Ordering::Release);
        });
    });

    assert_eq!(h.used_idx(0), REQUESTS);
    for i in 0..REQUESTS {
        assert_eq!(h.used_elem(0, i), (u32::from(i), 4));
        let mut reply = [0u8; 4];
        h.mem.read(BUF + u64::from(i) * 4, &mut reply).unwrap();
        assert_eq!(u32::from_le_bytes(reply), u32::from(i));
    }
    let doorbells = h
        .device
        .events()
        .iter()
        .filter(|e| **e == Event::Notified(0))
        .count();
    assert_eq!(doorbells, usize::from(REQUESTS));
}
