#![no_main]

use std::sync::Arc;

use arbitrary::{Arbitrary, Unstructured};
use libfuzzer_sys::fuzz_target;

use virtio_pci::layout::CapabilityKind;
use virtio_pci::memory::GuestRam;
use virtio_pci::spec::common_cfg;
use virtio_pci::{BumpRegionMapper, InterruptLog, VirtioDevice, VirtioPciDevice, VirtioPciOptions};

const RAM_SIZE: usize = 0x10_000;
const MAX_OPS: usize = 256;
const CONFIG_LEN: usize = 24;

struct FuzzDevice {
    features: u64,
}

impl VirtioDevice for FuzzDevice {
    fn device_type(&self) -> u16 {
        2
    }

    fn device_features(&self) -> u64 {
        self.features
    }

    fn config_len(&self) -> u32 {
        CONFIG_LEN as u32
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        for (i, b) in data.iter_mut().enumerate() {
            *b = (offset as usize + i) as u8;
        }
    }

    fn status_changed(&self, _driver_ok: bool) {}

    fn queue_notified(&self, _queue: u16) {}
}

#[derive(Debug, Clone, Copy, Arbitrary)]
enum Op {
    MmioRead { offset: u16, size: u8 },
    MmioWrite { offset: u16, size: u8, value: u64 },
    PciRead { offset: u8, size: u8 },
    PciWrite { offset: u8, size: u8, value: u32 },
    Get { queue: u8 },
    Skip { queue: u8 },
    Sync { queue: u8 },
    EnableNotify { queue: u8, enable: bool },
    ConfigChanged,
    RequestReset,
}

#[derive(Debug)]
struct Input {
    features: u64,
    msix: bool,
    ops: Vec<Op>,
}

impl<'a> Arbitrary<'a> for Input {
    fn arbitrary(u: &mut Unstructured<'a>) -> arbitrary::Result<Self> {
        let features = u.arbitrary()?;
        let msix = u.arbitrary()?;
        let len = u.int_in_range(0..=MAX_OPS)?;
        let mut ops = Vec::with_capacity(len);
        for _ in 0..len {
            ops.push(Op::arbitrary(u)?);
        }
        Ok(Self {
            features,
            msix,
            ops,
        })
    }
}

fn access_len(size: u8) -> usize {
    // Mostly valid widths, with the occasional odd one.
    match size % 6 {
        0 => 1,
        1 => 2,
        2 => 4,
        3 => 8,
        4 => 3,
        _ => 16,
    }
}

fuzz_target!(|data: &[u8]| {
    let mut u = Unstructured::new(data);
    let Ok(input) = Input::arbitrary(&mut u) else {
        return;
    };

    let mem = Arc::new(GuestRam::new(RAM_SIZE));
    let init_len = u.len();
    mem.fill_from(u.bytes(init_len).unwrap_or(&[]));

    let mut mapper = BumpRegionMapper::new(0xfe00_0000, 0x10_0000);
    let Ok(dev) = VirtioPciDevice::new(
        Arc::new(FuzzDevice {
            features: input.features,
        }),
        mem,
        Box::new(InterruptLog::new()),
        &mut mapper,
        VirtioPciOptions {
            num_queues: 4,
            queue_max_size: 64,
            msix: input.msix,
            ..Default::default()
        },
    ) else {
        return;
    };
    let region = dev.layout().region_size();

    for op in input.ops {
        match op {
            Op::MmioRead { offset, size } => {
                let mut buf = [0u8; 16];
                let buf = &mut buf[..access_len(size)];
                if dev.mmio_read(u64::from(offset) % region, buf).is_err() {
                    assert!(buf.iter().all(|&b| b == 0));
                }
            }
            Op::MmioWrite {
                offset,
                size,
                value,
            } => {
                let bytes = value.to_le_bytes();
                let len = access_len(size).min(bytes.len());
                let _ = dev.mmio_write(u64::from(offset) % region, &bytes[..len]);
            }
            Op::PciRead { offset, size } => {
                let mut buf = [0u8; 4];
                let len = access_len(size).min(4);
                dev.pci_config_read(u16::from(offset), &mut buf[..len]);
            }
            Op::PciWrite {
                offset,
                size,
                value,
            } => {
                let bytes = value.to_le_bytes();
                let len = access_len(size).min(4);
                dev.pci_config_write(u16::from(offset), &bytes[..len]);
            }
            Op::Get { queue } => {
                let queue = u16::from(queue % 5);
                if let Ok(Some(chain)) = dev.get(queue) {
                    let reply = vec![0xa5; chain.in_len().min(256) as usize];
                    let _ = dev.put(queue, &[&reply[..]], chain);
                }
            }
            Op::Skip { queue } => {
                let _ = dev.skip(u16::from(queue % 5));
            }
            Op::Sync { queue } => {
                let _ = dev.sync(u16::from(queue % 5));
            }
            Op::EnableNotify { queue, enable } => {
                let _ = dev.enable_notify(u16::from(queue % 5), enable);
            }
            Op::ConfigChanged => dev.notify_config_changed(),
            Op::RequestReset => dev.request_reset(),
        }
    }

    // Whatever the guest did, a reset returns the transport to a clean state.
    let common = dev
        .layout()
        .get(CapabilityKind::Common)
        .map_or(0, |cap| u64::from(cap.offset));
    let _ = dev.mmio_write(common + common_cfg::DEVICE_STATUS, &[0]);
    assert!(dev.device_status().is_empty());
    assert_eq!(dev.driver_features(), 0);
});
