//! Outbound sequence numbering

use std::sync::atomic::{AtomicU32, Ordering};

/// Monotonic per-sender frame counter.
///
/// Shared behind an `Arc` when several connections draw from one counter.
/// `next` is a single atomic `fetch_add`, so concurrent senders never see
/// duplicated or skipped values. Wraps at `u32::MAX`.
#[derive(Debug)]
pub struct SequenceCounter {
    next: AtomicU32,
}

impl SequenceCounter {
    pub fn new(start: u32) -> Self {
        Self {
            next: AtomicU32::new(start),
        }
    }

    /// Take the next sequence number
    pub fn next(&self) -> u32 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// The value the next call to `next` will return
    pub fn peek(&self) -> u32 {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new(0)
    }
}
