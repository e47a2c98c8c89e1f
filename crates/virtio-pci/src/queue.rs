//! Split virtqueue engine.
//!
//! The engine keeps two private cursors per queue: the next available-ring slot to consume and
//! the next used-ring slot to fill. Completions are staged in the used ring by [`QueueState::put`]
//! and only become visible to the driver when [`QueueState::publish_used`] stores the new used
//! index, so a batch of completions is published at once.
//!
//! Every access to the rings goes through [`GuestMemory`]; nothing here holds a pointer into guest
//! RAM. Values read from the rings are untrusted: ring indexes, descriptor indexes and chain
//! lengths are all validated before use.

use std::sync::atomic::{fence, Ordering};

use thiserror::Error;

use crate::memory::{read_u16_le, write_u16_le, write_u32_le, GuestMemory, GuestMemoryError};
use crate::ratelimit::{warn_guest, GuestWarnings};
use crate::spec::queue::{
    avail_offset_used_event, used_offset_avail_event, AvailFlags, Descriptor, UsedFlags,
    AVAIL_ELEMENT_SIZE, AVAIL_OFFSET_FLAGS, AVAIL_OFFSET_IDX, AVAIL_OFFSET_RING, DESCRIPTOR_SIZE,
    USED_ELEMENT_SIZE, USED_OFFSET_FLAGS, USED_OFFSET_IDX, USED_OFFSET_RING,
};
use crate::spec::VIRTIO_MSI_NO_VECTOR;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Misbehavior {
    #[error("descriptor chain longer than the ring (cycle?)")]
    ChainTooLong,
    #[error("descriptor index {0} is outside the ring")]
    DescriptorIndex(u16),
    #[error("available index is {0} entries ahead of the device, more than the ring holds")]
    AvailOverrun(u16),
    #[error("descriptor chain carries more than {limit} driver-readable bytes")]
    ChainTooLarge { limit: u64 },
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue {0} does not exist")]
    InvalidQueue(u16),
    #[error("queue {0} is not enabled or the driver is not ready")]
    InvalidState(u16),
    #[error("cannot allocate {len} bytes for a descriptor chain")]
    OutOfMemory { len: u64 },
    #[error("guest misbehavior on queue {queue}: {reason}")]
    GuestMisbehavior { queue: u16, reason: Misbehavior },
    #[error("reply of {reply} bytes does not fit the {capacity} device-writable bytes of the chain")]
    ReplyOverflow { reply: u64, capacity: u64 },
    #[error("descriptor chain was taken from queue {chain}, not queue {queue}")]
    ChainMismatch { chain: u16, queue: u16 },
    #[error("error accessing queue memory")]
    Memory(#[from] GuestMemoryError),
}

/// Guest bytes copied per step when assembling a chain's driver-readable data.
const GATHER_CHUNK: usize = 64 * 1024;

/// Longest queue name kept by the transport, in bytes.
pub const QUEUE_NAME_MAX_LEN: usize = 64;

/// One guest buffer referenced by a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub addr: u64,
    pub len: u32,
}

/// A descriptor chain taken off the available ring.
///
/// The driver-readable ("out") bytes have already been copied into host memory. The
/// device-writable ("in") side is kept as a list of guest buffers that [`QueueState::put`] fills.
/// A chain is handed back to the queue exactly once; it is deliberately not `Clone`.
#[derive(Debug)]
pub struct DescChain {
    queue: u16,
    head: u16,
    in_segments: Vec<Segment>,
    in_len: u64,
    out: Vec<u8>,
}

impl DescChain {
    pub fn queue(&self) -> u16 {
        self.queue
    }

    /// Index of the chain's first descriptor; reported back to the driver in the used ring.
    pub fn head_index(&self) -> u16 {
        self.head
    }

    pub fn in_segments(&self) -> &[Segment] {
        &self.in_segments
    }

    /// Total number of device-writable bytes.
    pub fn in_len(&self) -> u64 {
        self.in_len
    }

    pub fn out_buf(&self) -> &[u8] {
        &self.out
    }

    pub fn out_len(&self) -> usize {
        self.out.len()
    }

    /// Takes ownership of the driver-readable bytes, leaving the chain ready to be `put`.
    pub fn take_out_buf(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }
}

/// What a queue operation needs besides the queue itself.
pub(crate) struct QueueContext<'a> {
    pub mem: &'a dyn GuestMemory,
    /// VIRTIO_F_RING_EVENT_IDX was negotiated.
    pub event_idx: bool,
    pub warnings: &'a GuestWarnings,
    /// Bound on the driver-readable bytes of one chain.
    pub max_out_len: u64,
}

/// Driver-programmed configuration plus device-private cursors of one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueState {
    pub(crate) name: String,
    pub(crate) size: u16,
    pub(crate) enabled: bool,
    pub(crate) notify_off: u16,
    pub(crate) msix_vector: u16,
    pub(crate) desc_addr: u64,
    pub(crate) avail_addr: u64,
    pub(crate) used_addr: u64,
    /// Next available-ring slot the device will consume.
    pub(crate) avail_shadow: u16,
    /// Next used-ring slot the device will fill.
    pub(crate) used_shadow: u16,
    /// A `put` landed on the slot named by the driver's `used_event`.
    pub(crate) used_event_reached: bool,
}

impl QueueState {
    pub(crate) fn new(index: u16, max_size: u16) -> Self {
        Self {
            name: format!("queue{index}"),
            size: max_size,
            enabled: false,
            notify_off: index,
            msix_vector: VIRTIO_MSI_NO_VECTOR,
            desc_addr: 0,
            avail_addr: 0,
            used_addr: 0,
            avail_shadow: 0,
            used_shadow: 0,
            used_event_reached: false,
        }
    }

    /// Returns the queue to its power-on configuration. The name survives.
    pub(crate) fn reset(&mut self, index: u16, max_size: u16) {
        let name = std::mem::take(&mut self.name);
        *self = Self::new(index, max_size);
        self.name = name;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn msix_vector(&self) -> u16 {
        self.msix_vector
    }

    pub fn desc_addr(&self) -> u64 {
        self.desc_addr
    }

    pub fn avail_addr(&self) -> u64 {
        self.avail_addr
    }

    pub fn used_addr(&self) -> u64 {
        self.used_addr
    }

    pub fn avail_cursor(&self) -> u16 {
        self.avail_shadow
    }

    pub fn used_cursor(&self) -> u16 {
        self.used_shadow
    }

    fn misbehavior(&self, queue: u16, reason: Misbehavior) -> QueueError {
        QueueError::GuestMisbehavior { queue, reason }
    }

    fn read_avail_idx(&self, mem: &dyn GuestMemory) -> Result<u16, QueueError> {
        Ok(read_u16_le(mem, ring_gpa(self.avail_addr, AVAIL_OFFSET_IDX)?)?)
    }

    /// Number of chains the driver has made available and the device has not consumed yet.
    fn pending(&self, ctx: &QueueContext<'_>, queue: u16) -> Result<u16, QueueError> {
        let avail_idx = self.read_avail_idx(ctx.mem)?;
        let pending = avail_idx.wrapping_sub(self.avail_shadow);
        if pending > self.size {
            warn_guest!(
                ctx.warnings.avail_overrun,
                queue,
                avail_idx,
                cursor = self.avail_shadow,
                "available index overruns the ring"
            );
            return Err(self.misbehavior(queue, Misbehavior::AvailOverrun(pending)));
        }
        Ok(pending)
    }

    /// Number of chains ready for `get`. An index that overruns the ring is reported and clamped.
    pub(crate) fn available_count(
        &self,
        ctx: &QueueContext<'_>,
        queue: u16,
    ) -> Result<u16, QueueError> {
        match self.pending(ctx, queue) {
            Err(QueueError::GuestMisbehavior { .. }) => Ok(self.size),
            other => other,
        }
    }

    fn read_descriptor(&self, mem: &dyn GuestMemory, index: u16) -> Result<Descriptor, QueueError> {
        let mut raw = [0u8; DESCRIPTOR_SIZE as usize];
        let gpa = ring_gpa(self.desc_addr, u64::from(index) * DESCRIPTOR_SIZE)?;
        mem.read(gpa, &mut raw)?;
        Ok(Descriptor::from_le_bytes(raw))
    }

    /// Takes (or, with `remove == false`, peeks at) the next available chain.
    ///
    /// `Ok(None)` means the driver has not made anything new available. On any error the
    /// available cursor is left where it was; [`QueueState::skip`] drops a chain the driver
    /// corrupted.
    pub(crate) fn get(
        &mut self,
        ctx: &QueueContext<'_>,
        queue: u16,
        remove: bool,
    ) -> Result<Option<DescChain>, QueueError> {
        if self.pending(ctx, queue)? == 0 {
            return Ok(None);
        }
        // Ring entries and descriptors written before the index bump must be visible.
        fence(Ordering::Acquire);

        let slot = u64::from(self.avail_shadow % self.size);
        let head = read_u16_le(
            ctx.mem,
            ring_gpa(self.avail_addr, AVAIL_OFFSET_RING + slot * AVAIL_ELEMENT_SIZE)?,
        )?;
        let chain = self.walk(ctx, queue, head)?;

        if remove {
            self.advance_avail(ctx)?;
        }
        Ok(Some(chain))
    }

    /// Drops the next available chain without reading it. Returns `false` if nothing was
    /// available.
    pub(crate) fn skip(&mut self, ctx: &QueueContext<'_>, queue: u16) -> Result<bool, QueueError> {
        if self.pending(ctx, queue)? == 0 {
            return Ok(false);
        }
        self.advance_avail(ctx)?;
        Ok(true)
    }

    fn advance_avail(&mut self, ctx: &QueueContext<'_>) -> Result<(), QueueError> {
        let next = self.avail_shadow.wrapping_add(1);
        if ctx.event_idx {
            // Ask to be notified when the driver publishes the slot we will read next.
            write_u16_le(
                ctx.mem,
                ring_gpa(self.used_addr, used_offset_avail_event(self.size))?,
                next,
            )?;
        }
        self.avail_shadow = next;
        Ok(())
    }

    fn walk(&self, ctx: &QueueContext<'_>, queue: u16, head: u16) -> Result<DescChain, QueueError> {
        let mut in_segments = Vec::new();
        let mut out_segments = Vec::new();
        let mut in_len = 0u64;
        let mut out_len = 0u64;

        // Without indirect descriptors a well-formed chain visits each descriptor at most once,
        // so anything longer than the ring has a cycle.
        let max_segments = usize::from(self.size);
        let mut index = head;
        loop {
            if index >= self.size {
                warn_guest!(
                    ctx.warnings.descriptor_index,
                    queue,
                    index,
                    size = self.size,
                    "descriptor index out of range"
                );
                return Err(self.misbehavior(queue, Misbehavior::DescriptorIndex(index)));
            }
            if in_segments.len() + out_segments.len() >= max_segments {
                warn_guest!(
                    ctx.warnings.chain_too_long,
                    queue,
                    head,
                    "descriptor chain exceeds the ring size"
                );
                return Err(self.misbehavior(queue, Misbehavior::ChainTooLong));
            }

            let desc = self.read_descriptor(ctx.mem, index)?;
            let segment = Segment {
                addr: desc.addr,
                len: desc.len,
            };
            if desc.is_device_writable() {
                in_len += u64::from(desc.len);
                in_segments.push(segment);
            } else {
                out_len += u64::from(desc.len);
                if out_len > ctx.max_out_len {
                    warn_guest!(
                        ctx.warnings.chain_too_large,
                        queue,
                        head,
                        out_len,
                        limit = ctx.max_out_len,
                        "descriptor chain carries too many driver-readable bytes"
                    );
                    return Err(self.misbehavior(
                        queue,
                        Misbehavior::ChainTooLarge {
                            limit: ctx.max_out_len,
                        },
                    ));
                }
                out_segments.push(segment);
            }

            if !desc.has_next() {
                break;
            }
            index = desc.next;
        }

        let out = gather(ctx.mem, &out_segments, out_len)?;
        tracing::trace!(queue, head, in_len, out_len, "took descriptor chain");
        Ok(DescChain {
            queue,
            head,
            in_segments,
            in_len,
            out,
        })
    }

    /// Copies `reply` into the device-writable side of `chain` and stages a used-ring entry for
    /// it. The entry stays invisible to the driver until [`QueueState::publish_used`].
    ///
    /// Returns the number of bytes reported in the used element.
    pub(crate) fn put(
        &mut self,
        ctx: &QueueContext<'_>,
        queue: u16,
        reply: &[&[u8]],
        chain: DescChain,
    ) -> Result<u32, QueueError> {
        if chain.queue != queue {
            return Err(QueueError::ChainMismatch {
                chain: chain.queue,
                queue,
            });
        }
        let reply_len: u64 = reply.iter().map(|buf| buf.len() as u64).sum();
        let written = u32::try_from(reply_len)
            .ok()
            .filter(|_| reply_len <= chain.in_len)
            .ok_or(QueueError::ReplyOverflow {
                reply: reply_len,
                capacity: chain.in_len,
            })?;

        scatter(ctx.mem, &chain.in_segments, reply)?;

        if ctx.event_idx {
            let used_event = read_u16_le(
                ctx.mem,
                ring_gpa(self.avail_addr, avail_offset_used_event(self.size))?,
            )?;
            if used_event == self.used_shadow {
                self.used_event_reached = true;
            }
        }

        let slot = u64::from(self.used_shadow % self.size);
        let elem = ring_gpa(self.used_addr, USED_OFFSET_RING + slot * USED_ELEMENT_SIZE)?;
        write_u32_le(ctx.mem, elem, u32::from(chain.head))?;
        write_u32_le(ctx.mem, ring_gpa(elem, 4)?, written)?;
        self.used_shadow = self.used_shadow.wrapping_add(1);

        tracing::trace!(queue, head = chain.head, written, "staged used element");
        Ok(written)
    }

    /// Makes every staged used element visible to the driver.
    pub(crate) fn publish_used(&self, mem: &dyn GuestMemory) -> Result<(), QueueError> {
        // Used elements must be visible before the index that covers them.
        fence(Ordering::Release);
        write_u16_le(mem, ring_gpa(self.used_addr, USED_OFFSET_IDX)?, self.used_shadow)?;
        Ok(())
    }

    /// Whether the driver wants an interrupt for what was just published. Consumes the event-index
    /// trigger.
    pub(crate) fn needs_interrupt(&mut self, ctx: &QueueContext<'_>) -> Result<bool, QueueError> {
        // The used index store must be ordered before reading the driver's suppression state.
        fence(Ordering::SeqCst);
        if ctx.event_idx {
            return Ok(std::mem::take(&mut self.used_event_reached));
        }
        let flags = AvailFlags::from_bits_retain(read_u16_le(
            ctx.mem,
            ring_gpa(self.avail_addr, AVAIL_OFFSET_FLAGS)?,
        )?);
        Ok(!flags.contains(AvailFlags::NO_INTERRUPT))
    }

    /// Asks the driver to ring (or stop ringing) the doorbell for new available entries.
    pub(crate) fn enable_notify(
        &self,
        ctx: &QueueContext<'_>,
        enable: bool,
    ) -> Result<(), QueueError> {
        if ctx.event_idx {
            if enable {
                write_u16_le(
                    ctx.mem,
                    ring_gpa(self.used_addr, used_offset_avail_event(self.size))?,
                    self.avail_shadow,
                )?;
            }
            return Ok(());
        }
        let gpa = ring_gpa(self.used_addr, USED_OFFSET_FLAGS)?;
        let mut flags = UsedFlags::from_bits_retain(read_u16_le(ctx.mem, gpa)?);
        flags.set(UsedFlags::NO_NOTIFY, !enable);
        write_u16_le(ctx.mem, gpa, flags.bits())?;
        Ok(())
    }
}

/// Address of the ring field `offset` bytes past the driver-programmed `base`.
fn ring_gpa(base: u64, offset: u64) -> Result<u64, GuestMemoryError> {
    base.checked_add(offset)
        .ok_or(GuestMemoryError::OutOfRange { gpa: base, len: 0 })
}

fn gather(mem: &dyn GuestMemory, segments: &[Segment], total: u64) -> Result<Vec<u8>, QueueError> {
    let mut out = Vec::new();
    for seg in segments {
        let mut addr = seg.addr;
        let mut left = seg.len as usize;
        // Copy in bounded steps so an unbacked segment fails before its full length is allocated.
        while left > 0 {
            let n = left.min(GATHER_CHUNK);
            let start = out.len();
            out.try_reserve(n)
                .map_err(|_| QueueError::OutOfMemory { len: total })?;
            out.resize(start + n, 0);
            mem.read(addr, &mut out[start..])?;
            left -= n;
            if left > 0 {
                addr = addr
                    .checked_add(n as u64)
                    .ok_or(GuestMemoryError::OutOfRange { gpa: addr, len: left })?;
            }
        }
    }
    Ok(out)
}

fn scatter(mem: &dyn GuestMemory, segments: &[Segment], reply: &[&[u8]]) -> Result<(), QueueError> {
    let mut segments = segments.iter().filter(|s| s.len > 0);
    let mut current: Option<(u64, u64)> = None;
    for buf in reply {
        let mut buf = *buf;
        while !buf.is_empty() {
            let (addr, remaining) = match current {
                Some(seg) if seg.1 > 0 => seg,
                _ => match segments.next() {
                    Some(seg) => (seg.addr, u64::from(seg.len)),
                    // Callers check the reply against `in_len` first.
                    None => return Ok(()),
                },
            };
            let n = remaining.min(buf.len() as u64) as usize;
            mem.write(addr, &buf[..n])?;
            current = if remaining > n as u64 {
                let next = addr
                    .checked_add(n as u64)
                    .ok_or(GuestMemoryError::OutOfRange { gpa: addr, len: n })?;
                Some((next, remaining - n as u64))
            } else {
                None
            };
            buf = &buf[n..];
        }
    }
    Ok(())
}
