//! Transfer types and async completion bookkeeping.
//!
//! The tracker here is the quiesce mechanism for close: every async
//! submission registers, every completion (including cancelled ones)
//! deregisters, and `close` blocks on the condvar until the outstanding
//! count reaches zero. Cancellation works by bumping a generation counter;
//! a transfer whose token is stale completes with [`TransferStatus::Cancelled`]
//! without touching the device.

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::{BeagleError, Result};

/// Outcome of one async transfer, delivered to its completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Transfer finished; for in-transfers the byte count accompanies it.
    Completed,
    /// Timeout elapsed before completion.
    TimedOut,
    /// Transfer was cancelled before it reached the device.
    Cancelled,
    /// Endpoint returned a STALL handshake.
    Stall,
    /// Device left the bus.
    Disconnected,
    /// Any other failure.
    Failed,
}

impl TransferStatus {
    /// Whether the transfer completed successfully.
    #[must_use]
    pub const fn is_completed(self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Map a libusb transfer error to a status.
    #[must_use]
    pub const fn from_rusb(err: rusb::Error) -> Self {
        match err {
            rusb::Error::Timeout => Self::TimedOut,
            rusb::Error::NoDevice => Self::Disconnected,
            rusb::Error::Pipe => Self::Stall,
            rusb::Error::Interrupted => Self::Cancelled,
            _ => Self::Failed,
        }
    }

    /// Convert to a result, with `timeout` used for the timeout variant.
    ///
    /// # Errors
    ///
    /// Returns the corresponding [`BeagleError`] for every non-completed
    /// status.
    pub fn into_result(self, timeout: Duration) -> Result<()> {
        match self {
            Self::Completed => Ok(()),
            Self::TimedOut => Err(BeagleError::Timeout {
                duration_ms: timeout.as_millis() as u64,
            }),
            Self::Cancelled => Err(BeagleError::Cancelled),
            Self::Stall => Err(BeagleError::Stall),
            Self::Disconnected => Err(BeagleError::Disconnected),
            Self::Failed => Err(BeagleError::transfer_failed("async transfer failed")),
        }
    }
}

/// USB SETUP packet for a control transfer.
#[derive(Debug, Clone, Copy)]
pub struct SetupPacket {
    /// `bmRequestType`: direction, type, recipient.
    pub request_type: u8,
    /// `bRequest`.
    pub request: u8,
    /// `wValue`.
    pub value: u16,
    /// `wIndex`.
    pub index: u16,
    /// `wLength` of the data stage.
    pub length: u16,
}

/// A transfer buffer, allocated from the device's pool.
///
/// Zero-copy DMA-capable allocation is not available through libusb's safe
/// surface, so the pool recycles plain heap buffers; the caller-visible
/// contract is the same. The buffer rides through async completion callbacks
/// and back to the caller, which keeps ownership unambiguous for the whole
/// submission-to-callback window.
#[derive(Debug)]
pub struct TransferBuffer {
    data: Vec<u8>,
}

impl TransferBuffer {
    pub(crate) fn with_len(len: usize) -> Self {
        Self { data: vec![0; len] }
    }

    pub(crate) fn from_vec(mut data: Vec<u8>, len: usize) -> Self {
        data.resize(len, 0);
        Self { data }
    }

    pub(crate) fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl From<Vec<u8>> for TransferBuffer {
    fn from(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl Deref for TransferBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for TransferBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Callback for an async out-transfer. Fires exactly once, from an
/// implementation-chosen thread, returning the buffer to the caller.
pub type OutTransferCallback = Box<dyn FnOnce(TransferStatus, TransferBuffer) + Send + 'static>;

/// Callback for an async in-transfer. Fires exactly once with the status,
/// the buffer, and the byte count actually transferred.
pub type InTransferCallback =
    Box<dyn FnOnce(TransferStatus, TransferBuffer, usize) + Send + 'static>;

#[derive(Debug)]
struct TrackerInner {
    outstanding: usize,
    generation: u64,
    closing: bool,
    max_outstanding: usize,
}

/// Outstanding-transfer set, guarded by its own lock so completion
/// bookkeeping never waits behind slow synchronous calls on the handle lock.
#[derive(Debug)]
pub(crate) struct TransferTracker {
    inner: Mutex<TrackerInner>,
    quiesced: Condvar,
}

impl TransferTracker {
    pub(crate) fn new(max_outstanding: usize) -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                outstanding: 0,
                generation: 0,
                closing: false,
                max_outstanding,
            }),
            quiesced: Condvar::new(),
        }
    }

    /// Register a new async transfer; returns a generation token.
    pub(crate) fn register(&self) -> Result<u64> {
        let mut inner = self.inner.lock().expect("transfer tracker poisoned");
        if inner.closing {
            return Err(BeagleError::NotOpen);
        }
        if inner.outstanding >= inner.max_outstanding {
            return Err(BeagleError::resource_exhausted(format!(
                "async transfer slots ({} in flight)",
                inner.outstanding
            )));
        }
        inner.outstanding += 1;
        Ok(inner.generation)
    }

    /// Whether a token is still live (not cancelled, not closing).
    pub(crate) fn is_current(&self, token: u64) -> bool {
        let inner = self.inner.lock().expect("transfer tracker poisoned");
        !inner.closing && inner.generation == token
    }

    /// Mark one transfer complete and wake any quiesce waiter.
    pub(crate) fn complete(&self) {
        let mut inner = self.inner.lock().expect("transfer tracker poisoned");
        debug_assert!(inner.outstanding > 0, "completion without registration");
        inner.outstanding = inner.outstanding.saturating_sub(1);
        if inner.outstanding == 0 {
            self.quiesced.notify_all();
        }
    }

    /// Invalidate all outstanding tokens. Affected transfers complete with a
    /// cancellation status; their callbacks still fire.
    pub(crate) fn cancel_all(&self) {
        let mut inner = self.inner.lock().expect("transfer tracker poisoned");
        inner.generation += 1;
    }

    /// Enter closing state: cancel everything and refuse new registrations.
    pub(crate) fn begin_close(&self) {
        let mut inner = self.inner.lock().expect("transfer tracker poisoned");
        inner.closing = true;
        inner.generation += 1;
    }

    /// Block until every outstanding transfer has completed its callback.
    pub(crate) fn wait_quiesced(&self) {
        let mut inner = self.inner.lock().expect("transfer tracker poisoned");
        while inner.outstanding > 0 {
            inner = self
                .quiesced
                .wait(inner)
                .expect("transfer tracker poisoned");
        }
    }

    #[cfg(test)]
    pub(crate) fn outstanding(&self) -> usize {
        self.inner.lock().expect("transfer tracker poisoned").outstanding
    }
}

/// Recycling pool behind `allocate_transfer_buffer`.
#[derive(Debug, Default)]
pub(crate) struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub(crate) fn allocate(&self, len: usize) -> TransferBuffer {
        let mut free = self.free.lock().expect("buffer pool poisoned");
        let reusable = free.iter().position(|b| b.capacity() >= len);
        match reusable {
            Some(i) => TransferBuffer::from_vec(free.swap_remove(i), len),
            None => TransferBuffer::with_len(len),
        }
    }

    pub(crate) fn release(&self, buffer: TransferBuffer) {
        let mut free = self.free.lock().expect("buffer pool poisoned");
        // Cap the pool so a burst of large transfers doesn't pin memory.
        if free.len() < 16 {
            free.push(buffer.into_vec());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_register_and_complete() {
        let tracker = TransferTracker::new(2);
        let token = tracker.register().unwrap();
        assert!(tracker.is_current(token));
        assert_eq!(tracker.outstanding(), 1);
        tracker.complete();
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn tracker_slot_exhaustion() {
        let tracker = TransferTracker::new(1);
        let _token = tracker.register().unwrap();
        assert!(matches!(
            tracker.register(),
            Err(BeagleError::ResourceExhausted { .. })
        ));
    }

    #[test]
    fn cancel_invalidates_tokens() {
        let tracker = TransferTracker::new(4);
        let token = tracker.register().unwrap();
        tracker.cancel_all();
        assert!(!tracker.is_current(token));
        // New registrations get the new generation.
        let fresh = tracker.register().unwrap();
        assert!(tracker.is_current(fresh));
        tracker.complete();
        tracker.complete();
    }

    #[test]
    fn closing_refuses_registration() {
        let tracker = TransferTracker::new(4);
        tracker.begin_close();
        assert!(matches!(tracker.register(), Err(BeagleError::NotOpen)));
    }

    #[test]
    fn buffer_pool_recycles() {
        let pool = BufferPool::default();
        let buffer = pool.allocate(4096);
        assert_eq!(buffer.len(), 4096);
        pool.release(buffer);
        let again = pool.allocate(1024);
        assert!(again.data.capacity() >= 4096);
        assert_eq!(again.len(), 1024);
    }
}
