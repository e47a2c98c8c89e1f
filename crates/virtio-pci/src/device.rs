//! The contract between the transport and a device-specific backend (net, blk, console, ...).

use io_snapshot::SnapshotResult;

/// Callbacks a concrete device backend provides to the transport.
///
/// Methods take `&self`: the transport calls them from whichever thread trapped the guest
/// access, and the backend guards its own state.
///
/// `read_config` and `write_config` run while the transport lock is held and must not call back
/// into the transport. `status_changed` and `queue_notified` run after the lock is released and
/// may use the virtqueue engine directly.
pub trait VirtioDevice: Send + Sync {
    /// VirtIO device type (1 = net, 2 = block, 3 = console, ...).
    fn device_type(&self) -> u16;

    /// Feature bits offered to the driver.
    fn device_features(&self) -> u64;

    /// Size of the device-specific configuration block in bytes.
    fn config_len(&self) -> u32 {
        0
    }

    /// Reads device-specific configuration. Guest reads are served by reading the whole block at
    /// offset 0, which is also what the transport compares against its shadow copy to maintain
    /// the configuration generation.
    fn read_config(&self, offset: u64, data: &mut [u8]) {
        let _ = offset;
        data.fill(0);
    }

    fn write_config(&self, offset: u64, data: &[u8]) {
        let _ = (offset, data);
    }

    /// The driver set (`true`) or cleared (`false`) DRIVER_OK, or reset the device (`false`).
    fn status_changed(&self, driver_ok: bool);

    /// The driver rang the doorbell of `queue`.
    fn queue_notified(&self, queue: u16);

    /// Device-private state to carry in the transport snapshot.
    fn save_state(&self) -> Option<Vec<u8>> {
        None
    }

    fn load_state(&self, bytes: &[u8]) -> SnapshotResult<()> {
        let _ = bytes;
        Ok(())
    }

    /// Called once the whole transport state has been restored.
    fn load_done(&self) {}
}
