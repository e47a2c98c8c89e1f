//! Guest notification: decides whether a completion needs an interrupt and delivers it either
//! on the legacy INTx line (through the ISR byte) or on an MSI-X vector.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::queue::{QueueContext, QueueError, QueueState};
use crate::spec::{VIRTIO_ISR_CONFIG, VIRTIO_ISR_QUEUE, VIRTIO_MSI_NO_VECTOR};

/// A sink for interrupts produced by the transport.
pub trait InterruptSink: Send {
    fn raise_legacy_irq(&mut self);
    fn lower_legacy_irq(&mut self);
    fn signal_msix(&mut self, vector: u16);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptMode {
    /// Level-triggered INTx with the ISR byte as the cause register.
    IntX,
    /// Per-queue and config MSI-X vectors.
    Msix,
}

pub(crate) struct InterruptController {
    sink: Box<dyn InterruptSink>,
    msix_capable: bool,
    mode: InterruptMode,
    isr: u8,
    line_asserted: bool,
    msix_config_vector: u16,
}

impl InterruptController {
    pub fn new(sink: Box<dyn InterruptSink>, msix_capable: bool) -> Self {
        let mut me = Self {
            sink,
            msix_capable,
            mode: InterruptMode::IntX,
            isr: 0,
            line_asserted: false,
            msix_config_vector: VIRTIO_MSI_NO_VECTOR,
        };
        me.reset();
        me
    }

    /// Picks the delivery mode and drops any pending cause. Called on every device reset.
    pub fn reset(&mut self) {
        self.mode = if self.msix_capable {
            InterruptMode::Msix
        } else {
            InterruptMode::IntX
        };
        self.isr = 0;
        self.msix_config_vector = VIRTIO_MSI_NO_VECTOR;
        self.lower_line();
    }

    pub fn mode(&self) -> InterruptMode {
        self.mode
    }

    pub fn isr(&self) -> u8 {
        self.isr
    }

    pub fn msix_config_vector(&self) -> u16 {
        self.msix_config_vector
    }

    pub fn set_msix_config_vector(&mut self, vector: u16) {
        self.msix_config_vector = vector;
    }

    /// Restores the cause register and re-asserts INTx if a cause was pending.
    pub fn restore(&mut self, isr: u8, msix_config_vector: u16) {
        self.isr = isr;
        self.msix_config_vector = msix_config_vector;
        if self.mode == InterruptMode::IntX && isr != 0 && !self.line_asserted {
            self.sink.raise_legacy_irq();
            self.line_asserted = true;
        }
    }

    /// Returns the ISR byte and clears it, de-asserting INTx.
    pub fn read_isr_and_clear(&mut self) -> u8 {
        let isr = std::mem::take(&mut self.isr);
        if self.mode == InterruptMode::IntX {
            self.lower_line();
        }
        isr
    }

    /// Signals the guest after used-ring publication on `queue`, unless the guest suppressed it.
    ///
    /// `force` bypasses suppression; spurious interrupts only cost the guest a ring scan.
    pub fn notify_queue(
        &mut self,
        queue: &mut QueueState,
        ctx: &QueueContext<'_>,
        force: bool,
    ) -> Result<bool, QueueError> {
        // The suppression state is still consumed when forcing, but an unreadable ring does not
        // cancel a forced interrupt.
        let fire = match queue.needs_interrupt(ctx) {
            Ok(wanted) => wanted || force,
            Err(err) if force => {
                tracing::debug!(%err, "cannot read interrupt suppression; signalling anyway");
                true
            }
            Err(err) => return Err(err),
        };
        if fire {
            self.kick(VIRTIO_ISR_QUEUE, queue.msix_vector());
        }
        Ok(fire)
    }

    pub fn notify_config_change(&mut self) {
        self.kick(VIRTIO_ISR_CONFIG, self.msix_config_vector);
    }

    fn kick(&mut self, cause: u8, vector: u16) {
        match self.mode {
            InterruptMode::IntX => {
                self.isr |= cause;
                if !self.line_asserted {
                    self.sink.raise_legacy_irq();
                    self.line_asserted = true;
                }
            }
            InterruptMode::Msix => {
                if vector != VIRTIO_MSI_NO_VECTOR {
                    self.sink.signal_msix(vector);
                } else {
                    tracing::trace!(cause, "no msi-x vector assigned; interrupt dropped");
                }
            }
        }
    }

    fn lower_line(&mut self) {
        if self.line_asserted {
            self.sink.lower_legacy_irq();
            self.line_asserted = false;
        }
    }
}

#[derive(Debug, Default)]
struct InterruptLogState {
    legacy_irq_count: u64,
    line_asserted: bool,
    msix_vectors: Vec<u16>,
}

/// An [`InterruptSink`] that records everything it receives.
///
/// Clones share the same record, so a test can keep one handle and give the other to the
/// transport.
#[derive(Debug, Clone, Default)]
pub struct InterruptLog {
    inner: Arc<Mutex<InterruptLogState>>,
}

impl InterruptLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn legacy_irq_count(&self) -> u64 {
        self.inner.lock().legacy_irq_count
    }

    pub fn line_asserted(&self) -> bool {
        self.inner.lock().line_asserted
    }

    pub fn msix_vectors(&self) -> Vec<u16> {
        self.inner.lock().msix_vectors.clone()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.legacy_irq_count = 0;
        inner.msix_vectors.clear();
    }
}

impl InterruptSink for InterruptLog {
    fn raise_legacy_irq(&mut self) {
        let mut inner = self.inner.lock();
        inner.legacy_irq_count += 1;
        inner.line_asserted = true;
    }

    fn lower_legacy_irq(&mut self) {
        self.inner.lock().line_asserted = false;
    }

    fn signal_msix(&mut self, vector: u16) {
        self.inner.lock().msix_vectors.push(vector);
    }
}
