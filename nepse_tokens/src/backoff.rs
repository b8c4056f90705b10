//! Error backoff handling for bundle requests

use std::time::Duration;

/// Configuration for how to retry and back off when a request fails
#[derive(Clone, Debug)]
pub struct ErrorBackoffConfig {
    initial_error_delay: Duration,
    max_error_delay: Duration,
    multiplier: u32,
    max_retries: u32,
}

impl Default for ErrorBackoffConfig {
    /// Default backoff configuration
    ///
    /// Retries up to 3 times, with an initial error delay of 1 second and a
    /// multiplier of 2. Delay is capped at 30 seconds.
    fn default() -> Self {
        Self {
            initial_error_delay: Duration::from_secs(1),
            max_error_delay: Duration::from_secs(30),
            multiplier: 2,
            max_retries: 3,
        }
    }
}

impl ErrorBackoffConfig {
    /// Constructs a new backoff configuration
    ///
    /// When encountering an error for the first time, the backoff will be `initial_error_delay`.
    /// On subsequent errors, the backoff is multiplied by `multiplier`, with a cap of
    /// `max_error_delay`. No more than `max_retries` retries follow the first attempt.
    pub fn new(
        initial_error_delay: Duration,
        max_error_delay: Duration,
        multiplier: u32,
        max_retries: u32,
    ) -> Self {
        Self {
            initial_error_delay,
            max_error_delay,
            multiplier,
            max_retries,
        }
    }

    /// A configuration that never retries
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }
}

/// A stateful handler that manages error backoff state
#[derive(Debug)]
pub struct ErrorBackoffHandler {
    config: ErrorBackoffConfig,
    last_delay: Option<Duration>,
    retries: u32,
}

impl ErrorBackoffHandler {
    /// Constructs a new handler from an [`ErrorBackoffConfig`].
    pub fn new(config: ErrorBackoffConfig) -> Self {
        Self {
            config,
            last_delay: None,
            retries: 0,
        }
    }

    /// Reports a failure and returns the delay before the next attempt
    ///
    /// Returns `None` once the retry budget is spent.
    pub fn error(&mut self) -> Option<Duration> {
        if self.retries >= self.config.max_retries {
            return None;
        }
        self.retries += 1;

        let new_delay = self
            .last_delay
            .map(|s| {
                s.saturating_mul(self.config.multiplier)
                    .min(self.config.max_error_delay)
            })
            .unwrap_or(self.config.initial_error_delay);
        self.last_delay = Some(new_delay);
        Some(new_delay)
    }
}
