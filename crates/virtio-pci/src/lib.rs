//! VirtIO 1.0 PCI transport.
//!
//! This crate implements the device side of the modern virtio-pci transport: the vendor
//! capability layout, the common/notify/ISR/device register windows, feature negotiation and
//! device status, and the split virtqueue engine used by device backends to exchange buffers
//! with the guest driver.
//!
//! A concrete device (net, block, ...) implements [`device::VirtioDevice`] and drives its queues
//! through [`pci::VirtioPciDevice`].

mod ratelimit;

pub mod device;
pub mod interrupt;
pub mod layout;
pub mod memory;
pub mod pci;
pub mod queue;
pub mod snapshot;
pub mod spec;

pub use device::VirtioDevice;
pub use interrupt::{InterruptLog, InterruptMode, InterruptSink};
pub use pci::{
    BumpRegionMapper, IoError, RegionMapError, RegionMapper, TransportError, VirtioPciDevice,
    VirtioPciOptions, DEFAULT_MAX_CHAIN_OUT_LEN,
};
pub use queue::{DescChain, Misbehavior, QueueError, QueueState, Segment};
pub use ratelimit::RateLimitedWarning;
pub use snapshot::{VirtioPciState, VirtqueueSnapshot};
