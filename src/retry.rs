//! Bounded retries with exponential backoff for a single item.
//!
//! The controller wraps one item's executor call. Each failed attempt that
//! the policy wants retried emits an `itemRetry` event, sleeps
//! `backoff_ms × backoff_multiplier^(attempt − 1)` and tries again. The
//! sleep holds no scheduler slot: the slot is taken per attempt inside the
//! wrapped call.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SwarmError;
use crate::events::{EngineEvent, EventBus};
use crate::task::TaskResult;

/// Default number of attempts.
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay between attempts in milliseconds.
const DEFAULT_BACKOFF_MS: u64 = 1000;

/// Default growth factor of the delay.
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Longest single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Decides whether a result should be retried.
pub type RetryPredicate = Arc<dyn Fn(&TaskResult) -> bool + Send + Sync>;

/// How often and how patiently an item is retried.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first, at least 1.
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub backoff_multiplier: f64,
    retry_on: Option<RetryPredicate>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff_ms", &self.backoff_ms)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("custom_retry_on", &self.retry_on.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_ms: DEFAULT_BACKOFF_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            retry_on: None,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with `max_attempts` attempts and default backoff.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::new(1)
    }

    pub fn with_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.backoff_ms = backoff_ms;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Replaces the default "retry on error status" rule.
    pub fn with_retry_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&TaskResult) -> bool + Send + Sync + 'static,
    {
        self.retry_on = Some(Arc::new(predicate));
        self
    }

    /// Whether `result` qualifies for another attempt.
    pub fn should_retry(&self, result: &TaskResult) -> bool {
        match &self.retry_on {
            Some(predicate) => predicate(result),
            None => result.is_error(),
        }
    }

    /// Sleep before the attempt following `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        if millis.is_nan() || millis <= 0.0 {
            return Duration::ZERO;
        }
        if millis >= MAX_BACKOFF.as_millis() as f64 {
            return MAX_BACKOFF;
        }
        Duration::try_from_secs_f64(millis / 1000.0).unwrap_or(MAX_BACKOFF)
    }

    /// # Errors
    ///
    /// Returns `SwarmError::InvalidPolicy` for zero attempts or a negative
    /// or non-finite multiplier.
    pub fn validate(&self) -> Result<(), SwarmError> {
        if self.max_attempts == 0 {
            return Err(SwarmError::invalid_policy(
                "retry",
                "max_attempts must be at least 1",
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 0.0 {
            return Err(SwarmError::invalid_policy(
                "retry",
                format!(
                    "backoff_multiplier must be a finite, non-negative number (got {})",
                    self.backoff_multiplier
                ),
            ));
        }
        Ok(())
    }
}

/// Serializable retry settings, as read from environment or YAML.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_ms: DEFAULT_BACKOFF_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl From<RetrySettings> for RetryPolicy {
    fn from(settings: RetrySettings) -> Self {
        RetryPolicy::new(settings.max_attempts)
            .with_backoff_ms(settings.backoff_ms)
            .with_backoff_multiplier(settings.backoff_multiplier)
    }
}

impl From<&RetryPolicy> for RetrySettings {
    fn from(policy: &RetryPolicy) -> Self {
        Self {
            max_attempts: policy.max_attempts,
            backoff_ms: policy.backoff_ms,
            backoff_multiplier: policy.backoff_multiplier,
        }
    }
}

/// Where a retried call lives, for event reporting.
#[derive(Debug, Clone, Copy)]
pub struct ItemContext<'a> {
    pub events: &'a EventBus,
    pub stage_index: usize,
    pub item_index: usize,
}

impl<'a> ItemContext<'a> {
    pub fn new(events: &'a EventBus, stage_index: usize, item_index: usize) -> Self {
        Self {
            events,
            stage_index,
            item_index,
        }
    }
}

/// Runs `call` until it produces a result the policy does not want retried
/// or attempts run out.
///
/// `call` receives the 1-based attempt number. The returned result carries
/// the number of attempts consumed in `meta.attempts`.
///
/// # Errors
///
/// Only infrastructure errors from `call` are returned; they end the loop
/// immediately.
pub async fn run_with_retry<F, Fut>(
    policy: &RetryPolicy,
    ctx: ItemContext<'_>,
    mut call: F,
) -> Result<TaskResult, SwarmError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<TaskResult, SwarmError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let mut result = call(attempt).await?;

        if attempt < max_attempts && policy.should_retry(&result) {
            let reason = result.failure_reason();
            let delay = policy.delay_for(attempt);
            debug!(
                stage_index = ctx.stage_index,
                item_index = ctx.item_index,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Backing off before next attempt"
            );
            ctx.events.emit(EngineEvent::item_retry(
                ctx.stage_index,
                ctx.item_index,
                attempt,
                reason,
            ));
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
            continue;
        }

        result.meta.attempts = Some(attempt);
        return Ok(result);
    }
}
