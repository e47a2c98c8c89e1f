mod common;

use common::{harness, small_options, Event};
use pretty_assertions::assert_eq;
use virtio_pci::spec::{
    common_cfg, DeviceStatus, VIRTIO_F_VERSION_1, VIRTIO_ISR_CONFIG, VIRTIO_MSI_NO_VECTOR,
};
use virtio_pci::{InterruptMode, VirtioPciOptions};

#[test]
fn driver_ok_edges_notify_the_backend_once() {
    let h = harness(VIRTIO_F_VERSION_1, vec![0; 4], small_options());
    h.negotiate(VIRTIO_F_VERSION_1);
    assert!(h.device.events().is_empty());

    h.driver_ok();
    assert!(h.dev.is_driver_ok());
    // Rewriting the same status is not an edge.
    h.driver_ok();
    assert_eq!(h.device.take_events(), vec![Event::Status(true)]);

    h.set_status(DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER | DeviceStatus::FEATURES_OK);
    assert_eq!(h.device.take_events(), vec![Event::Status(false)]);
}

#[test]
fn writing_zero_resets_the_transport() {
    let h = harness(VIRTIO_F_VERSION_1, vec![0; 4], small_options());
    h.dev.attach_queue(0, "requests").unwrap();
    h.start(0, 4);
    h.write16(common_cfg::QUEUE_MSIX_VECTOR, 5);
    h.write32(common_cfg::DEVICE_FEATURE_SELECT, 1);
    h.device.set_config(0, &[1]);
    let _ = h.device_cfg_read(0, 1);
    assert_eq!(h.dev.config_generation(), 1);
    h.device.take_events();

    h.set_status(DeviceStatus::empty());

    assert_eq!(h.device.take_events(), vec![Event::Status(false)]);
    assert_eq!(h.dev.device_status(), DeviceStatus::empty());
    assert_eq!(h.dev.driver_features(), 0);
    assert_eq!(h.dev.config_generation(), 0);
    assert_eq!(h.read32(common_cfg::DEVICE_FEATURE_SELECT), 0);
    assert_eq!(h.read16(common_cfg::QUEUE_SELECT), 0);

    let q = h.dev.queue_state(0).unwrap();
    assert_eq!(q.name(), "requests");
    assert_eq!(q.size(), 16);
    assert!(!q.is_enabled());
    assert_eq!(q.msix_vector(), VIRTIO_MSI_NO_VECTOR);
    assert_eq!((q.desc_addr(), q.avail_addr(), q.used_addr()), (0, 0, 0));
    assert_eq!((q.avail_cursor(), q.used_cursor()), (0, 0));
}

#[test]
fn reset_is_reported_even_before_driver_ok() {
    let h = harness(VIRTIO_F_VERSION_1, Vec::new(), small_options());
    h.set_status(DeviceStatus::ACKNOWLEDGE);
    h.set_status(DeviceStatus::empty());
    assert_eq!(h.device.take_events(), vec![Event::Status(false)]);
}

#[test]
fn request_reset_needs_driver_ok() {
    let h = harness(VIRTIO_F_VERSION_1, Vec::new(), small_options());
    h.dev.request_reset();
    assert!(!h.status().contains(DeviceStatus::DEVICE_NEEDS_RESET));
    assert_eq!(h.irqs.legacy_irq_count(), 0);

    h.start(0, 4);
    h.dev.request_reset();
    assert!(h.status().contains(DeviceStatus::DEVICE_NEEDS_RESET));
    assert_eq!(h.irqs.legacy_irq_count(), 1);
    assert_eq!(h.read_isr(), VIRTIO_ISR_CONFIG);

    // The driver answers by resetting.
    h.set_status(DeviceStatus::empty());
    assert_eq!(h.status(), DeviceStatus::empty());
}

#[test]
fn interrupt_mode_follows_options() {
    let h = harness(VIRTIO_F_VERSION_1, Vec::new(), small_options());
    assert_eq!(h.dev.interrupt_mode(), InterruptMode::IntX);

    let h = harness(
        VIRTIO_F_VERSION_1,
        Vec::new(),
        VirtioPciOptions {
            msix: true,
            ..small_options()
        },
    );
    assert_eq!(h.dev.interrupt_mode(), InterruptMode::Msix);
    h.set_status(DeviceStatus::empty());
    assert_eq!(h.dev.interrupt_mode(), InterruptMode::Msix);
}

#[test]
fn generation_moves_when_config_changes() {
    let h = harness(VIRTIO_F_VERSION_1, vec![1, 2, 3, 4], small_options());
    assert_eq!(h.device_cfg_read(0, 4), vec![1, 2, 3, 4]);
    assert_eq!(h.read8(common_cfg::CONFIG_GENERATION), 0);

    h.device.set_config(3, &[9]);
    // Reading any part of the block notices the change.
    assert_eq!(h.device_cfg_read(0, 1), vec![1]);
    assert_eq!(h.read8(common_cfg::CONFIG_GENERATION), 1);
    assert_eq!(h.device_cfg_read(3, 1), vec![9]);
    assert_eq!(h.read8(common_cfg::CONFIG_GENERATION), 1);
}

#[test]
fn host_announced_change_bumps_on_next_read_and_interrupts() {
    let h = harness(VIRTIO_F_VERSION_1, vec![0; 4], small_options());
    h.start(0, 4);

    h.dev.notify_config_changed();
    assert_eq!(h.irqs.legacy_irq_count(), 1);
    assert_eq!(h.dev.pending_isr(), VIRTIO_ISR_CONFIG);
    assert_eq!(h.read8(common_cfg::CONFIG_GENERATION), 0);

    let _ = h.device_cfg_read(0, 2);
    assert_eq!(h.read8(common_cfg::CONFIG_GENERATION), 1);
    let _ = h.device_cfg_read(0, 2);
    assert_eq!(h.read8(common_cfg::CONFIG_GENERATION), 1);
}

#[test]
fn config_change_before_driver_ok_is_silent() {
    let h = harness(VIRTIO_F_VERSION_1, vec![0; 4], small_options());
    h.dev.notify_config_changed();
    assert_eq!(h.irqs.legacy_irq_count(), 0);
    let _ = h.device_cfg_read(0, 1);
    assert_eq!(h.dev.config_generation(), 1);
}

#[test]
fn device_config_reads_past_the_block_are_zero() {
    let h = harness(VIRTIO_F_VERSION_1, vec![0xaa; 6], small_options());
    assert_eq!(h.device_cfg_read(4, 4), vec![0xaa, 0xaa, 0, 0]);
}

#[test]
fn device_config_writes_reach_the_backend() {
    let h = harness(VIRTIO_F_VERSION_1, vec![0; 8], small_options());
    let device_cap = h.cap(virtio_pci::layout::CapabilityKind::Device);
    h.dev
        .mmio_write(u64::from(device_cap.offset) + 4, &0x1234u16.to_le_bytes())
        .unwrap();
    assert_eq!(h.device.config.lock().unwrap()[4..6], [0x34, 0x12]);
    assert!(h
        .dev
        .mmio_write(u64::from(device_cap.offset) + 6, &[0; 4])
        .is_err());
}
