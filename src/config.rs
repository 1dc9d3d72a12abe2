use std::env;
use std::time::Duration;

use rand::Rng;

use crate::error::EngineError;

pub const DEFAULT_REFRESH_DAYS: i64 = 7;
pub const MAX_REFRESH_DAYS: i64 = 3650;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Backoff for retryable generator failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): exponential, capped,
    /// plus up to 25% random jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        let jitter_ms = (delay.as_millis() as u64) / 4;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

/// Everything the engine components need, handed to them at construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Time between generation and the next scheduled refresh.
    pub refresh_interval: chrono::Duration,
    pub retry: RetryPolicy,
    /// Keys refreshed in parallel by one sweep.
    pub refresh_concurrency: usize,
    pub max_tokens: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            refresh_interval: chrono::Duration::days(DEFAULT_REFRESH_DAYS),
            retry: RetryPolicy::default(),
            refresh_concurrency: DEFAULT_CONCURRENCY,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl EngineConfig {
    /// Interval of `days` whole days, rejecting values chrono cannot represent.
    pub fn refresh_interval_days(days: i64) -> Result<chrono::Duration, EngineError> {
        chrono::Duration::try_days(days)
            .ok_or_else(|| EngineError::Config(format!("refresh interval of {} days is out of range", days)))
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.refresh_interval <= chrono::Duration::zero() {
            return Err(EngineError::Config(
                "refresh interval must be positive".to_string(),
            ));
        }
        if self.refresh_interval > chrono::Duration::days(MAX_REFRESH_DAYS) {
            return Err(EngineError::Config(format!(
                "refresh interval must be at most {} days",
                MAX_REFRESH_DAYS
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::Config(
                "max attempts must be at least 1".to_string(),
            ));
        }
        if self.refresh_concurrency == 0 {
            return Err(EngineError::Config(
                "refresh concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Provider credentials, read once at start-up.
#[derive(Debug, Clone, Default)]
pub struct ApiKeys {
    pub gemini: Option<String>,
    pub anthropic: Option<String>,
    pub openai: Option<String>,
}

impl ApiKeys {
    pub fn from_env() -> Self {
        let read = |name: &str| env::var(name).ok().filter(|v| !v.trim().is_empty());
        Self {
            gemini: read("GEMINI_API_KEY"),
            anthropic: read("ANTHROPIC_API_KEY"),
            openai: read("OPENAI_API_KEY"),
        }
    }
}
