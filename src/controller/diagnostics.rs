use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::warn;

const DIAGNOSTIC_TIMEOUT: Duration = Duration::from_secs(60);

/// De-duplicates high-cardinality warnings.
///
/// A message is logged at warn level at most once per timeout window; `gc`
/// drops expired entries and runs from plugin finalizers.
#[derive(Default)]
pub struct Diagnostics {
    seen: HashMap<String, Instant>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics::default()
    }

    /// Logs the message unless an identical one was logged within the
    /// timeout. Returns whether the message was emitted.
    pub fn warn_once(&mut self, message: String) -> bool {
        let now = Instant::now();
        if let Some(at) = self.seen.get(&message) {
            if now.duration_since(*at) < DIAGNOSTIC_TIMEOUT {
                return false;
            }
        }
        warn!("{message}");
        self.seen.insert(message, now);
        true
    }

    /// Removes entries older than the timeout.
    pub fn gc(&mut self) {
        let now = Instant::now();
        self.seen
            .retain(|_, at| now.duration_since(*at) < DIAGNOSTIC_TIMEOUT);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.seen.len()
    }
}
