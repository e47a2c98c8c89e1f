//! The virtio-pci transport: device lifecycle, feature negotiation and the host-facing API.
//!
//! One [`VirtioPciDevice`] serves one device instance. All transport state sits behind a single
//! lock, taken by guest register accesses (vCPU threads) and by virtqueue operations (backend
//! worker threads) alike. Backend callbacks that may re-enter the transport (`status_changed`,
//! `queue_notified`) are collected while the lock is held and delivered after it is dropped.

mod config_space;
mod regs;

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::VirtioDevice;
use crate::interrupt::{InterruptController, InterruptMode, InterruptSink};
use crate::layout::CapabilityLayout;
use crate::memory::GuestMemory;
use crate::queue::{DescChain, QueueContext, QueueError, QueueState, QUEUE_NAME_MAX_LEN};
use crate::ratelimit::GuestWarnings;
use crate::spec::{DeviceStatus, VIRTIO_F_RING_EVENT_IDX, VIRTQ_MAX_COUNT, VIRTQ_MAX_SIZE};

pub use config_space::{CAP_BASE, PCI_CONFIG_SPACE_SIZE};
pub use regs::IoError;

pub(crate) use config_space::PciConfigSpace;

/// Default bound on the driver-readable bytes of one descriptor chain.
pub const DEFAULT_MAX_CHAIN_OUT_LEN: u32 = 16 * 1024 * 1024;

/// Construction-time knobs of a transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VirtioPciOptions {
    /// Queue slots exposed to the driver.
    pub num_queues: u16,
    /// Largest ring size the driver may select; also the size each queue resets to.
    pub queue_max_size: u16,
    /// Deliver interrupts over MSI-X instead of INTx.
    pub msix: bool,
    /// BAR index holding the capability region. The BAR is 64-bit and also uses `region_bar + 1`.
    pub region_bar: u8,
    /// Most driver-readable bytes one descriptor chain may carry; `get` refuses larger chains.
    pub max_chain_out_len: u32,
}

impl Default for VirtioPciOptions {
    fn default() -> Self {
        Self {
            num_queues: VIRTQ_MAX_COUNT,
            queue_max_size: VIRTQ_MAX_SIZE,
            msix: false,
            region_bar: 0,
            max_chain_out_len: DEFAULT_MAX_CHAIN_OUT_LEN,
        }
    }
}

impl VirtioPciOptions {
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.num_queues == 0 || self.num_queues > VIRTQ_MAX_COUNT {
            return Err(TransportError::InvalidOptions("num_queues must be in 1..=24"));
        }
        if !self.queue_max_size.is_power_of_two() || self.queue_max_size > VIRTQ_MAX_SIZE {
            return Err(TransportError::InvalidOptions(
                "queue_max_size must be a power of two no larger than 1024",
            ));
        }
        if self.region_bar > 4 {
            return Err(TransportError::InvalidOptions("region_bar must be in 0..=4"));
        }
        if self.max_chain_out_len == 0 {
            return Err(TransportError::InvalidOptions("max_chain_out_len must be non-zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct RegionMapError(pub String);

/// Reserves guest-physical address space for the capability region.
pub trait RegionMapper {
    /// Maps a region of `size` bytes (a power of two) for BAR `bar` and returns its base address.
    fn map_region(&mut self, bar: u8, size: u64) -> Result<u64, RegionMapError>;
}

/// A [`RegionMapper`] that hands out naturally aligned regions from a fixed window.
#[derive(Debug, Clone)]
pub struct BumpRegionMapper {
    next: u64,
    end: u64,
}

impl BumpRegionMapper {
    pub fn new(base: u64, len: u64) -> Self {
        Self {
            next: base,
            end: base.saturating_add(len),
        }
    }
}

impl RegionMapper for BumpRegionMapper {
    fn map_region(&mut self, bar: u8, size: u64) -> Result<u64, RegionMapError> {
        let base = self
            .next
            .checked_next_multiple_of(size.max(1))
            .filter(|base| base.checked_add(size).is_some_and(|end| end <= self.end))
            .ok_or_else(|| {
                RegionMapError(format!("no room for a {size:#x}-byte region for BAR{bar}"))
            })?;
        self.next = base + size;
        Ok(base)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid transport options: {0}")]
    InvalidOptions(&'static str),
    #[error("device configuration block of {0} bytes is too large")]
    ConfigTooLarge(u32),
    #[error("failed to reserve a {size:#x}-byte region for BAR{bar}")]
    RegionReservation {
        bar: u8,
        size: u64,
        #[source]
        source: RegionMapError,
    },
    #[error("invalid snapshot")]
    Snapshot(#[from] io_snapshot::SnapshotError),
    #[error("snapshot does not match this device: {0}")]
    SnapshotMismatch(&'static str),
}

/// A backend callback deferred until the transport lock is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeviceEvent {
    StatusChanged(bool),
    QueueNotified(u16),
}

/// Everything guarded by the transport lock.
pub(crate) struct TransportState {
    pub device_feature_select: u32,
    pub driver_feature_select: u32,
    pub driver_features: u64,
    pub device_status: DeviceStatus,
    /// Status as of the last status write; DRIVER_OK edges are detected against it.
    pub prev_device_status: DeviceStatus,
    pub config_generation: u8,
    /// The host announced a configuration change the driver has not observed yet.
    pub gen_update_pending: bool,
    pub device_cfg_shadow: Vec<u8>,
    pub queue_select: u16,
    pub queues: Vec<QueueState>,
    pub interrupts: InterruptController,
    pub config_space: PciConfigSpace,
    pub region_base: u64,
}

/// A virtio 1.0 device exposed over PCI.
pub struct VirtioPciDevice {
    pub(crate) device: Arc<dyn VirtioDevice>,
    mem: Arc<dyn GuestMemory>,
    pub(crate) options: VirtioPciOptions,
    pub(crate) layout: CapabilityLayout,
    pub(crate) device_features: u64,
    pub(crate) device_cfg_len: u32,
    warnings: GuestWarnings,
    pub(crate) state: Mutex<TransportState>,
}

impl VirtioPciDevice {
    pub fn new(
        device: Arc<dyn VirtioDevice>,
        mem: Arc<dyn GuestMemory>,
        interrupts: Box<dyn InterruptSink>,
        mapper: &mut dyn RegionMapper,
        options: VirtioPciOptions,
    ) -> Result<Self, TransportError> {
        options.validate()?;

        let device_cfg_len = device.config_len();
        // The region must stay addressable through the 32-bit capability offsets.
        if device_cfg_len > 0x1000_0000 {
            return Err(TransportError::ConfigTooLarge(device_cfg_len));
        }
        let layout = CapabilityLayout::new(options.region_bar, options.num_queues, device_cfg_len);
        let size = layout.region_size();
        let region_base = mapper
            .map_region(options.region_bar, size)
            .map_err(|source| TransportError::RegionReservation {
                bar: options.region_bar,
                size,
                source,
            })?;

        let mut device_cfg_shadow = vec![0; device_cfg_len as usize];
        device.read_config(0, &mut device_cfg_shadow);

        let queues = (0..options.num_queues)
            .map(|i| QueueState::new(i, options.queue_max_size))
            .collect();
        let device_type = device.device_type();
        let device_features = device.device_features();

        tracing::debug!(
            device_type,
            device_features = format_args!("{device_features:#x}"),
            region_base = format_args!("{region_base:#x}"),
            region_size = size,
            num_queues = options.num_queues,
            "created virtio-pci transport"
        );

        Ok(Self {
            state: Mutex::new(TransportState {
                device_feature_select: 0,
                driver_feature_select: 0,
                driver_features: 0,
                device_status: DeviceStatus::empty(),
                prev_device_status: DeviceStatus::empty(),
                config_generation: 0,
                gen_update_pending: false,
                device_cfg_shadow,
                queue_select: 0,
                queues,
                interrupts: InterruptController::new(interrupts, options.msix),
                config_space: PciConfigSpace::new(device_type, &layout, region_base),
                region_base,
            }),
            device,
            mem,
            options,
            layout,
            device_features,
            device_cfg_len,
            warnings: GuestWarnings::default(),
        })
    }

    pub fn options(&self) -> &VirtioPciOptions {
        &self.options
    }

    pub fn layout(&self) -> &CapabilityLayout {
        &self.layout
    }

    pub fn region_base(&self) -> u64 {
        self.state.lock().region_base
    }

    pub fn device_features(&self) -> u64 {
        self.device_features
    }

    pub fn driver_features(&self) -> u64 {
        self.state.lock().driver_features
    }

    /// Features both sides agreed on.
    pub fn negotiated_features(&self) -> u64 {
        self.state.lock().driver_features & self.device_features
    }

    pub fn device_status(&self) -> DeviceStatus {
        self.state.lock().device_status
    }

    pub fn is_driver_ok(&self) -> bool {
        self.device_status().contains(DeviceStatus::DRIVER_OK)
    }

    pub fn config_generation(&self) -> u8 {
        self.state.lock().config_generation
    }

    pub fn interrupt_mode(&self) -> InterruptMode {
        self.state.lock().interrupts.mode()
    }

    /// The ISR byte, without the read-to-clear side effect of a guest read.
    pub fn pending_isr(&self) -> u8 {
        self.state.lock().interrupts.isr()
    }

    pub fn is_queue_enabled(&self, queue: u16) -> bool {
        self.state
            .lock()
            .queues
            .get(usize::from(queue))
            .is_some_and(|q| q.enabled)
    }

    /// A copy of the queue's current configuration and cursors.
    pub fn queue_state(&self, queue: u16) -> Option<QueueState> {
        self.state.lock().queues.get(usize::from(queue)).cloned()
    }

    /// Names a queue for diagnostics and snapshots and rewinds its cursors. Long names are
    /// truncated.
    pub fn attach_queue(&self, queue: u16, name: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let q = state
            .queues
            .get_mut(usize::from(queue))
            .ok_or(QueueError::InvalidQueue(queue))?;
        q.avail_shadow = 0;
        q.used_shadow = 0;
        q.used_event_reached = false;
        q.name = name
            .char_indices()
            .take_while(|(i, c)| i + c.len_utf8() <= QUEUE_NAME_MAX_LEN)
            .map(|(_, c)| c)
            .collect();
        Ok(())
    }

    /// Reads from the capability region at `offset`. On error `data` is zero-filled.
    pub fn mmio_read(&self, offset: u64, data: &mut [u8]) -> Result<(), IoError> {
        data.fill(0);
        let mut state = self.state.lock();
        let result = self.read_locked(&mut state, offset, data);
        if result.is_err() {
            data.fill(0);
        }
        result
    }

    /// Writes to the capability region at `offset`.
    pub fn mmio_write(&self, offset: u64, data: &[u8]) -> Result<(), IoError> {
        let mut events = Vec::new();
        let result = {
            let mut state = self.state.lock();
            self.write_locked(&mut state, offset, data, &mut events)
        };
        self.dispatch(events);
        result
    }

    /// Reads PCI configuration space. Reads of the PCI_CFG data window are forwarded to the
    /// capability region.
    pub fn pci_config_read(&self, offset: u16, data: &mut [u8]) {
        data.fill(0);
        let offset = usize::from(offset);
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let window = state.config_space.pci_cfg_data_range();
        if !window.contains(&offset) {
            state.config_space.read(offset, data);
            return;
        }

        let target = state.config_space.pci_cfg_window();
        let Some(len) = self.pci_cfg_access_len(target.bar, target.length) else {
            return;
        };
        let mut buf = [0u8; 4];
        if let Err(err) = self.read_locked(state, u64::from(target.offset), &mut buf[..len]) {
            tracing::debug!(offset = target.offset, %err, "pci_cfg window read failed");
            return;
        }
        let rel = offset - window.start;
        let n = data.len().min(4 - rel);
        data[..n].copy_from_slice(&buf[rel..rel + n]);
    }

    /// Writes PCI configuration space. Writes to the PCI_CFG data window are forwarded to the
    /// capability region.
    pub fn pci_config_write(&self, offset: u16, data: &[u8]) {
        let offset = usize::from(offset);
        let mut events = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let window = state.config_space.pci_cfg_data_range();
            if offset != window.start {
                state.config_space.write(offset, data);
            } else {
                let target = state.config_space.pci_cfg_window();
                if let Some(len) = self.pci_cfg_access_len(target.bar, target.length) {
                    let len = len.min(data.len());
                    if let Err(err) =
                        self.write_locked(state, u64::from(target.offset), &data[..len], &mut events)
                    {
                        tracing::debug!(offset = target.offset, %err, "pci_cfg window write failed");
                    }
                }
            }
        }
        self.dispatch(events);
    }

    fn pci_cfg_access_len(&self, bar: u8, length: u32) -> Option<usize> {
        (bar == self.layout.bar() && matches!(length, 1 | 2 | 4)).then_some(length as usize)
    }

    /// Announces a change of the device-specific configuration to the driver.
    pub fn notify_config_changed(&self) {
        let mut state = self.state.lock();
        state.gen_update_pending = true;
        if state.device_status.contains(DeviceStatus::DRIVER_OK) {
            state.interrupts.notify_config_change();
        }
    }

    /// Asks the driver to reset the device (DEVICE_NEEDS_RESET). Ignored until DRIVER_OK.
    pub fn request_reset(&self) {
        let mut state = self.state.lock();
        if !state.device_status.contains(DeviceStatus::DRIVER_OK) {
            tracing::debug!("reset request ignored; driver not ready");
            return;
        }
        state.device_status |= DeviceStatus::DEVICE_NEEDS_RESET;
        state.prev_device_status = state.device_status;
        state.interrupts.notify_config_change();
    }

    /// Re-signals every enabled queue after the VM resumes, in case an interrupt was lost.
    pub fn vm_resumed(&self) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.device_status.contains(DeviceStatus::DRIVER_OK) {
            return;
        }
        let ctx = self.queue_context(state);
        for (index, q) in state.queues.iter_mut().enumerate() {
            if !q.enabled {
                continue;
            }
            if let Err(err) = state.interrupts.notify_queue(q, &ctx, true) {
                tracing::warn!(queue = index, %err, "failed to re-signal queue after resume");
            }
        }
    }

    /// Takes the next available chain from `queue`, or `None` if the driver offered nothing new.
    pub fn get(&self, queue: u16) -> Result<Option<DescChain>, QueueError> {
        self.with_ready_queue(queue, |q, ctx, _| q.get(ctx, queue, true))
    }

    /// Like [`VirtioPciDevice::get`], but leaves the chain on the ring.
    pub fn peek(&self, queue: u16) -> Result<Option<DescChain>, QueueError> {
        self.with_ready_queue(queue, |q, ctx, _| q.get(ctx, queue, false))
    }

    /// Drops the next available chain unread. Returns `false` if none was available.
    pub fn skip(&self, queue: u16) -> Result<bool, QueueError> {
        self.with_ready_queue(queue, |q, ctx, _| q.skip(ctx, queue))
    }

    /// Completes `chain` with `reply`. The completion is staged; call
    /// [`VirtioPciDevice::sync`] to publish it.
    pub fn put(&self, queue: u16, reply: &[&[u8]], chain: DescChain) -> Result<u32, QueueError> {
        self.with_ready_queue(queue, |q, ctx, _| q.put(ctx, queue, reply, chain))
    }

    /// Publishes staged completions and interrupts the driver unless it suppressed that.
    pub fn sync(&self, queue: u16) -> Result<(), QueueError> {
        self.with_ready_queue(queue, |q, ctx, interrupts| {
            q.publish_used(ctx.mem)?;
            interrupts.notify_queue(q, ctx, false)?;
            Ok(())
        })
    }

    /// Unread available entries on `queue`; zero while the queue is not ready.
    pub fn available_count(&self, queue: u16) -> Result<u16, QueueError> {
        match self.with_ready_queue(queue, |q, ctx, _| q.available_count(ctx, queue)) {
            Err(QueueError::InvalidState(_)) => Ok(0),
            other => other,
        }
    }

    /// Enables or suppresses driver doorbells for `queue`.
    pub fn enable_notify(&self, queue: u16, enable: bool) -> Result<(), QueueError> {
        self.with_ready_queue(queue, |q, ctx, _| q.enable_notify(ctx, enable))
    }

    fn queue_context<'a>(&'a self, state: &TransportState) -> QueueContext<'a> {
        QueueContext {
            mem: &*self.mem,
            event_idx: state.driver_features & self.device_features & VIRTIO_F_RING_EVENT_IDX != 0,
            warnings: &self.warnings,
            max_out_len: u64::from(self.options.max_chain_out_len),
        }
    }

    fn with_ready_queue<R>(
        &self,
        queue: u16,
        f: impl FnOnce(&mut QueueState, &QueueContext<'_>, &mut InterruptController) -> Result<R, QueueError>,
    ) -> Result<R, QueueError> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let ctx = self.queue_context(state);
        let driver_ok = state.device_status.contains(DeviceStatus::DRIVER_OK);
        let q = state
            .queues
            .get_mut(usize::from(queue))
            .ok_or(QueueError::InvalidQueue(queue))?;
        if !driver_ok || !q.enabled {
            return Err(QueueError::InvalidState(queue));
        }
        f(q, &ctx, &mut state.interrupts)
    }

    /// Applies a driver write of the status byte.
    fn write_status(&self, state: &mut TransportState, value: u8, events: &mut Vec<DeviceEvent>) {
        let status = DeviceStatus::from_bits_retain(value);
        if status.is_empty() {
            tracing::debug!("driver reset the device");
            self.reset_locked(state);
            events.push(DeviceEvent::StatusChanged(false));
            return;
        }

        let was_ok = state.prev_device_status.contains(DeviceStatus::DRIVER_OK);
        let is_ok = status.contains(DeviceStatus::DRIVER_OK);
        if status.contains(DeviceStatus::FEATURES_OK)
            && !state.prev_device_status.contains(DeviceStatus::FEATURES_OK)
        {
            tracing::debug!(
                features = format_args!("{:#x}", state.driver_features & self.device_features),
                "features negotiated"
            );
        }
        if status.contains(DeviceStatus::FAILED) {
            tracing::debug!("driver gave up on the device");
        }
        state.device_status = status;
        state.prev_device_status = status;
        if was_ok != is_ok {
            tracing::debug!(driver_ok = is_ok, "driver status changed");
            events.push(DeviceEvent::StatusChanged(is_ok));
        }
    }

    /// Returns the transport to its power-on state. Queue names survive.
    fn reset_locked(&self, state: &mut TransportState) {
        state.device_feature_select = 0;
        state.driver_feature_select = 0;
        state.driver_features = 0;
        state.device_status = DeviceStatus::empty();
        state.prev_device_status = DeviceStatus::empty();
        state.config_generation = 0;
        state.gen_update_pending = false;
        state.queue_select = 0;
        state.interrupts.reset();
        for (index, q) in (0u16..).zip(state.queues.iter_mut()) {
            q.reset(index, self.options.queue_max_size);
        }
    }

    fn dispatch(&self, events: Vec<DeviceEvent>) {
        for event in events {
            match event {
                DeviceEvent::StatusChanged(driver_ok) => self.device.status_changed(driver_ok),
                DeviceEvent::QueueNotified(queue) => self.device.queue_notified(queue),
            }
        }
    }
}
