use std::sync::atomic::{AtomicU64, Ordering};

/// Strictly increasing identifiers for correlatable outgoing messages.
///
/// The first identifier after construction or [`reset`](Self::reset) is `1`.
#[derive(Debug, Default)]
pub struct MessageIdAllocator {
    last: AtomicU64,
}

impl MessageIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn next_id(&self) -> u64 {
        self.last.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Most recently allocated identifier (`0` when none since the last reset).
    #[inline]
    pub fn last_id(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }

    /// Restart the sequence for a brand-new physical connection.
    pub fn reset(&self) {
        self.last.store(0, Ordering::Release);
    }
}
