//! Strictly monotone nonce generation.

use std::time::{SystemTime, UNIX_EPOCH};

/// Produces strictly increasing microsecond nonces.
///
/// Each draw returns `max(last + 1, now_us)`, so the sequence keeps
/// advancing even when the wall clock jumps backwards or stands still.
#[derive(Debug, Default)]
pub struct NonceGenerator {
    last: u64,
}

impl NonceGenerator {
    /// Creates a generator starting from zero.
    #[must_use]
    pub const fn new() -> Self {
        Self { last: 0 }
    }

    /// Returns the next nonce.
    pub fn next(&mut self) -> u64 {
        let now_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX))
            .unwrap_or(0);

        self.last = now_us.max(self.last.saturating_add(1));
        self.last
    }
}
