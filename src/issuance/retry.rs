use std::{sync::Arc, time::Duration};

use log::{debug, warn};

use crate::core::config::PollingSettings;

type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

/// Bounded exponential backoff shared by authorization and finalization polling.
#[derive(Clone)]
pub struct PollPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    sleeper: Sleeper,
}

impl std::fmt::Debug for PollPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

impl PollPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            sleeper: Arc::new(std::thread::sleep),
        }
    }

    pub fn from_settings(settings: &PollingSettings) -> Self {
        Self::new(
            settings.max_attempts,
            Duration::from_secs(settings.initial_delay_secs),
            Duration::from_secs(settings.max_delay_secs),
        )
    }

    /// Replaces `thread::sleep`, e.g. to record delays in tests.
    pub fn with_sleeper(mut self, sleeper: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the zero-based `attempt`: `initial * 2^attempt`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Calls `check` until it yields a value, fails, or attempts run out.
    ///
    /// `Ok(None)` from `check` means "not yet". Errors stop polling at once.
    /// Exhaustion returns `Ok(None)`; no sleep follows the final attempt.
    pub fn poll<T, E, F>(&self, operation: &str, mut check: F) -> Result<Option<T>, E>
    where
        F: FnMut(u32) -> Result<Option<T>, E>,
    {
        for attempt in 0..self.max_attempts {
            debug!(
                "[acme] {} poll attempt {}/{}",
                operation,
                attempt + 1,
                self.max_attempts
            );
            if let Some(value) = check(attempt)? {
                return Ok(Some(value));
            }
            if attempt + 1 < self.max_attempts {
                let delay = self.delay_for(attempt);
                debug!("[acme] {} not ready, waiting {}s", operation, delay.as_secs());
                (self.sleeper)(delay);
            }
        }
        warn!(
            "[acme] {} still pending after {} attempts",
            operation, self.max_attempts
        );
        Ok(None)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::from_settings(&PollingSettings::default())
    }
}
