//! Duplicate-suppressed event logging.

use std::time::Duration;

use tracing::error;

/// Line emitter that drops immediate repeats.
///
/// A line identical to the previously emitted one is silently discarded
/// when it arrives within the suppression window; anything else is
/// recorded and forwarded to the log sink.
pub struct EventLog {
    suppression: Duration,
    last_line: Option<String>,
    last_emitted_at_s: Option<u64>,
}

impl EventLog {
    /// Creates an event log with the given suppression window.
    #[must_use]
    pub const fn new(suppression: Duration) -> Self {
        Self {
            suppression,
            last_line: None,
            last_emitted_at_s: None,
        }
    }

    /// Emits `line` unless it repeats the previous line within the
    /// suppression window. Returns whether the line was forwarded.
    pub fn log(&mut self, line: &str, now_s: u64) -> bool {
        if !self.should_emit(line, now_s) {
            return false;
        }
        self.last_line = Some(line.to_string());
        self.last_emitted_at_s = Some(now_s);
        error!(target: "nanny", "{line}");
        true
    }

    fn should_emit(&self, line: &str, now_s: u64) -> bool {
        let (Some(last_line), Some(last_at)) = (&self.last_line, self.last_emitted_at_s) else {
            return true;
        };
        if last_line != line {
            return true;
        }
        now_s.saturating_sub(last_at) >= self.suppression.as_secs()
    }
}
