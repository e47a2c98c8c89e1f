#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use io_snapshot::{SnapshotError, SnapshotResult};
use virtio_pci::layout::{CapabilityInfo, CapabilityKind};
use virtio_pci::memory::{read_u16_le, read_u32_le, GuestMemory, GuestRam};
use virtio_pci::spec::common_cfg;
use virtio_pci::spec::queue::DescriptorFlags;
use virtio_pci::spec::{DeviceStatus, VIRTIO_F_VERSION_1};
use virtio_pci::{
    BumpRegionMapper, InterruptLog, VirtioDevice, VirtioPciDevice, VirtioPciOptions,
};

pub const RAM_SIZE: usize = 0x40000;
pub const REGION_WINDOW: u64 = 0xfe00_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Status(bool),
    Notified(u16),
    LoadDone,
}

/// A backend that records every callback.
pub struct TestDevice {
    pub features: u64,
    pub config: Mutex<Vec<u8>>,
    pub events: Mutex<Vec<Event>>,
    pub blob: Mutex<Option<Vec<u8>>>,
    pub loaded: Mutex<Option<Vec<u8>>>,
    pub config_reads: AtomicUsize,
    /// When set, doorbells are serviced from inside the callback.
    pub transport: OnceLock<Weak<VirtioPciDevice>>,
    pub serviced: AtomicUsize,
}

impl TestDevice {
    pub fn new(features: u64, config: Vec<u8>) -> Self {
        Self {
            features,
            config: Mutex::new(config),
            events: Mutex::new(Vec::new()),
            blob: Mutex::new(None),
            loaded: Mutex::new(None),
            config_reads: AtomicUsize::new(0),
            transport: OnceLock::new(),
            serviced: AtomicUsize::new(0),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn take_events(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }

    pub fn set_config(&self, offset: usize, bytes: &[u8]) {
        self.config.lock().unwrap()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

impl VirtioDevice for TestDevice {
    fn device_type(&self) -> u16 {
        1
    }

    fn device_features(&self) -> u64 {
        self.features
    }

    fn config_len(&self) -> u32 {
        self.config.lock().unwrap().len() as u32
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        self.config_reads.fetch_add(1, Ordering::Relaxed);
        let config = self.config.lock().unwrap();
        let start = offset as usize;
        data.copy_from_slice(&config[start..start + data.len()]);
    }

    fn write_config(&self, offset: u64, data: &[u8]) {
        self.set_config(offset as usize, data);
    }

    fn status_changed(&self, driver_ok: bool) {
        self.events.lock().unwrap().push(Event::Status(driver_ok));
    }

    fn queue_notified(&self, queue: u16) {
        self.events.lock().unwrap().push(Event::Notified(queue));
        let Some(transport) = self.transport.get().and_then(Weak::upgrade) else {
            return;
        };
        // Echo every request back with an empty reply.
        while let Ok(Some(chain)) = transport.get(queue) {
            transport.put(queue, &[], chain).unwrap();
            self.serviced.fetch_add(1, Ordering::Relaxed);
        }
        transport.sync(queue).unwrap();
    }

    fn save_state(&self) -> Option<Vec<u8>> {
        self.blob.lock().unwrap().clone()
    }

    fn load_state(&self, bytes: &[u8]) -> SnapshotResult<()> {
        if bytes.is_empty() {
            return Err(SnapshotError::InvalidFieldEncoding("empty device blob"));
        }
        *self.loaded.lock().unwrap() = Some(bytes.to_vec());
        Ok(())
    }

    fn load_done(&self) {
        self.events.lock().unwrap().push(Event::LoadDone);
    }
}

pub struct Harness {
    pub dev: Arc<VirtioPciDevice>,
    pub mem: Arc<GuestRam>,
    pub device: Arc<TestDevice>,
    pub irqs: InterruptLog,
}

/// Routes transport logs to the test harness output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
        .try_init();
}

pub fn harness(features: u64, config: Vec<u8>, options: VirtioPciOptions) -> Harness {
    init_tracing();
    let mem = Arc::new(GuestRam::new(RAM_SIZE));
    let device = Arc::new(TestDevice::new(features, config));
    let irqs = InterruptLog::new();
    let mut mapper = BumpRegionMapper::new(REGION_WINDOW, 0x10_0000);
    let dev = VirtioPciDevice::new(
        device.clone(),
        mem.clone(),
        Box::new(irqs.clone()),
        &mut mapper,
        options,
    )
    .unwrap();
    Harness {
        dev: Arc::new(dev),
        mem,
        device,
        irqs,
    }
}

pub fn small_options() -> VirtioPciOptions {
    VirtioPciOptions {
        num_queues: 2,
        queue_max_size: 16,
        ..Default::default()
    }
}

/// Guest addresses of queue `q`'s rings.
pub fn queue_addrs(q: u16) -> (u64, u64, u64) {
    let base = 0x1000 + u64::from(q) * 0x4000;
    (base, base + 0x1000, base + 0x2000)
}

impl Harness {
    pub fn cap(&self, kind: CapabilityKind) -> CapabilityInfo {
        *self.dev.layout().get(kind).unwrap()
    }

    fn common(&self, off: u64) -> u64 {
        u64::from(self.cap(CapabilityKind::Common).offset) + off
    }

    pub fn write8(&self, off: u64, v: u8) {
        self.dev.mmio_write(self.common(off), &[v]).unwrap();
    }

    pub fn write16(&self, off: u64, v: u16) {
        self.dev.mmio_write(self.common(off), &v.to_le_bytes()).unwrap();
    }

    pub fn write32(&self, off: u64, v: u32) {
        self.dev.mmio_write(self.common(off), &v.to_le_bytes()).unwrap();
    }

    pub fn write64(&self, off: u64, v: u64) {
        self.dev.mmio_write(self.common(off), &v.to_le_bytes()).unwrap();
    }

    pub fn read8(&self, off: u64) -> u8 {
        let mut b = [0u8; 1];
        self.dev.mmio_read(self.common(off), &mut b).unwrap();
        b[0]
    }

    pub fn read16(&self, off: u64) -> u16 {
        let mut b = [0u8; 2];
        self.dev.mmio_read(self.common(off), &mut b).unwrap();
        u16::from_le_bytes(b)
    }

    pub fn read32(&self, off: u64) -> u32 {
        let mut b = [0u8; 4];
        self.dev.mmio_read(self.common(off), &mut b).unwrap();
        u32::from_le_bytes(b)
    }

    pub fn read64(&self, off: u64) -> u64 {
        let mut b = [0u8; 8];
        self.dev.mmio_read(self.common(off), &mut b).unwrap();
        u64::from_le_bytes(b)
    }

    pub fn read_isr(&self) -> u8 {
        let mut b = [0u8; 1];
        self.dev
            .mmio_read(u64::from(self.cap(CapabilityKind::Isr).offset), &mut b)
            .unwrap();
        b[0]
    }

    pub fn device_cfg_read(&self, off: u64, len: usize) -> Vec<u8> {
        let mut b = vec![0u8; len];
        self.dev
            .mmio_read(u64::from(self.cap(CapabilityKind::Device).offset) + off, &mut b)
            .unwrap();
        b
    }

    pub fn ring_doorbell(&self, q: u16) {
        let notify = self.cap(CapabilityKind::Notify);
        let off = u64::from(notify.offset) + u64::from(q) * 2;
        self.dev.mmio_write(off, &q.to_le_bytes()).unwrap();
    }

    pub fn set_status(&self, status: DeviceStatus) {
        self.write8(common_cfg::DEVICE_STATUS, status.bits());
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_retain(self.read8(common_cfg::DEVICE_STATUS))
    }

    /// Driver-side feature negotiation up to FEATURES_OK.
    pub fn negotiate(&self, features: u64) {
        self.set_status(DeviceStatus::ACKNOWLEDGE);
        self.set_status(DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER);
        self.write32(common_cfg::DRIVER_FEATURE_SELECT, 0);
        self.write32(common_cfg::DRIVER_FEATURE, features as u32);
        self.write32(common_cfg::DRIVER_FEATURE_SELECT, 1);
        self.write32(common_cfg::DRIVER_FEATURE, (features >> 32) as u32);
        self.set_status(
            DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER | DeviceStatus::FEATURES_OK,
        );
    }

    pub fn setup_queue(&self, q: u16, size: u16) {
        let (desc, avail, used) = queue_addrs(q);
        self.write16(common_cfg::QUEUE_SELECT, q);
        self.write16(common_cfg::QUEUE_SIZE, size);
        self.write64(common_cfg::QUEUE_DESC, desc);
        self.write64(common_cfg::QUEUE_DRIVER, avail);
        self.write64(common_cfg::QUEUE_DEVICE, used);
        self.write16(common_cfg::QUEUE_ENABLE, 1);
    }

    pub fn driver_ok(&self) {
        self.set_status(
            DeviceStatus::ACKNOWLEDGE
                | DeviceStatus::DRIVER
                | DeviceStatus::FEATURES_OK
                | DeviceStatus::DRIVER_OK,
        );
    }

    /// Negotiates `features`, enables queue 0 with `size` entries and sets DRIVER_OK.
    pub fn start(&self, features: u64, size: u16) {
        self.negotiate(features | VIRTIO_F_VERSION_1);
        self.setup_queue(0, size);
        self.driver_ok();
    }

    pub fn write_desc(
        &self,
        q: u16,
        index: u16,
        addr: u64,
        len: u32,
        flags: DescriptorFlags,
        next: u16,
    ) {
        let (desc, _, _) = queue_addrs(q);
        let at = desc + u64::from(index) * 16;
        self.mem.write(at, &addr.to_le_bytes()).unwrap();
        self.mem.write(at + 8, &len.to_le_bytes()).unwrap();
        self.mem.write(at + 12, &flags.bits().to_le_bytes()).unwrap();
        self.mem.write(at + 14, &next.to_le_bytes()).unwrap();
    }

    /// Places `head` in available slot `idx % size` and publishes `idx + 1`.
    pub fn push_avail(&self, q: u16, size: u16, idx: u16, head: u16) {
        let (_, avail, _) = queue_addrs(q);
        let slot = u64::from(idx % size);
        self.mem.write(avail + 4 + slot * 2, &head.to_le_bytes()).unwrap();
        self.mem
            .write(avail + 2, &idx.wrapping_add(1).to_le_bytes())
            .unwrap();
    }

    pub fn set_avail_flags(&self, q: u16, flags: u16) {
        let (_, avail, _) = queue_addrs(q);
        self.mem.write(avail, &flags.to_le_bytes()).unwrap();
    }

    pub fn set_used_event(&self, q: u16, size: u16, value: u16) {
        let (_, avail, _) = queue_addrs(q);
        self.mem
            .write(avail + 4 + 2 * u64::from(size), &value.to_le_bytes())
            .unwrap();
    }

    pub fn used_idx(&self, q: u16) -> u16 {
        let (_, _, used) = queue_addrs(q);
        read_u16_le(&*self.mem, used + 2).unwrap()
    }

    /// `(id, len)` of used slot `slot`.
    pub fn used_elem(&self, q: u16, slot: u16) -> (u32, u32) {
        let (_, _, used) = queue_addrs(q);
        let at = used + 4 + u64::from(slot) * 8;
        (
            read_u32_le(&*self.mem, at).unwrap(),
            read_u32_le(&*self.mem, at + 4).unwrap(),
        )
    }

    pub fn read_guest(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut b = vec![0u8; len];
        self.mem.read(addr, &mut b).unwrap();
        b
    }
}
