//! Retry and backoff patterns for handling transient failures
//!
//! Coordination-service calls are retried here after a session loss; the
//! caller only ever sees the final outcome.

use crate::error::{NetcfgError, NetcfgResult};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Backoff strategy for retry operations
#[derive(Debug, Clone)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed(Duration),
    /// Exponential increase in delay (base * multiplier^(attempt-1))
    Exponential {
        base: Duration,
        max: Duration,
        multiplier: f64,
    },
}

impl BackoffStrategy {
    /// Calculate the delay for a given attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed(duration) => *duration,

            BackoffStrategy::Exponential {
                base,
                max,
                multiplier,
            } => {
                let factor = multiplier.powf(attempt.saturating_sub(1) as f64);
                let delay_ms = (base.as_millis() as f64 * factor) as u64;
                std::cmp::min(Duration::from_millis(delay_ms), *max)
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Jitter strategy for retry delays
#[derive(Debug, Clone)]
pub enum JitterStrategy {
    None,
    /// delay * (min to max)
    ProportionalRange { min: f64, max: f64 },
    /// Random delay between 0 and the calculated delay
    Full,
}

impl Default for JitterStrategy {
    fn default() -> Self {
        JitterStrategy::ProportionalRange { min: 0.5, max: 1.5 }
    }
}

/// Configuration for retry operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the initial attempt)
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    pub jitter: bool,
    pub jitter_strategy: JitterStrategy,
    pub is_retryable: fn(&NetcfgError) -> bool,
    pub operation_name: Option<String>,
    pub enable_logging: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::default(),
            jitter: true,
            jitter_strategy: JitterStrategy::default(),
            is_retryable: NetcfgError::is_transient,
            operation_name: None,
            enable_logging: true,
        }
    }
}

impl RetryConfig {
    /// Create a simple fixed delay retry config
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: attempts,
            backoff: BackoffStrategy::Fixed(delay),
            ..Default::default()
        }
    }

    /// Retry policy for coordination-service calls after session loss
    pub fn for_coordination(
        operation_name: &str,
        max_attempts: u32,
        base: Duration,
        max: Duration,
    ) -> Self {
        Self {
            max_attempts,
            backoff: BackoffStrategy::Exponential {
                base,
                max,
                multiplier: 2.0,
            },
            jitter: true,
            jitter_strategy: JitterStrategy::Full,
            is_retryable: NetcfgError::is_transient,
            operation_name: Some(operation_name.to_string()),
            enable_logging: true,
        }
    }

    pub fn with_operation_name(mut self, name: impl Into<String>) -> Self {
        self.operation_name = Some(name.into());
        self
    }
}

fn apply_jitter(base_delay: Duration, strategy: &JitterStrategy) -> Duration {
    use rand::Rng;
    let mut rng = rand::thread_rng();

    match strategy {
        JitterStrategy::None => base_delay,

        JitterStrategy::ProportionalRange { min, max } => {
            let jitter_factor = rng.gen_range(*min..*max);
            Duration::from_millis((base_delay.as_millis() as f64 * jitter_factor) as u64)
        }

        JitterStrategy::Full => {
            let max_delay_ms = base_delay.as_millis() as u64;
            if max_delay_ms == 0 {
                base_delay
            } else {
                Duration::from_millis(rng.gen_range(0..=max_delay_ms))
            }
        }
    }
}

/// Retry an async operation with the given configuration
pub async fn retry<F, T>(config: RetryConfig, mut operation: F) -> NetcfgResult<T>
where
    F: FnMut() -> Pin<Box<dyn Future<Output = NetcfgResult<T>> + Send>>,
{
    let mut attempt = 0;
    let operation_name = config.operation_name.as_deref().unwrap_or("operation");

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 && config.enable_logging {
                    debug!("{} succeeded after {} attempts", operation_name, attempt);
                }
                return Ok(result);
            }
            Err(error) => {
                if !(config.is_retryable)(&error) {
                    return Err(error);
                }

                if attempt >= config.max_attempts {
                    warn!(
                        "{}: max retry attempts ({}) reached",
                        operation_name, config.max_attempts
                    );
                    return Err(error);
                }

                let mut delay = config.backoff.delay(attempt);
                if config.jitter {
                    delay = apply_jitter(delay, &config.jitter_strategy);
                }

                if config.enable_logging {
                    warn!(
                        "Retry attempt {}/{} for {} after error: {} (waiting {:?})",
                        attempt, config.max_attempts, operation_name, error, delay
                    );
                }

                sleep(delay).await;
            }
        }
    }
}
