//! Retry strategy resolution and the per-tick retry decision.
//!
//! A template with a `retryStrategy` is run as a Retry node whose children
//! are attempts `name(0)`, `name(1)`, ... . The strategy is resolved once
//! when the Retry node is created and stored on it, so later edits to
//! parameters cannot change the attempt budget mid-flight.

use std::time::Duration;

use chrono::{DateTime, Utc};
use weft_types::config::ControllerConfig;
use weft_types::duration::{format_duration, parse_duration};
use weft_types::node::{Node, NodePhase, ResolvedRetry};
use weft_types::workflow::{IntOrString, RetryPolicy, RetryStrategy};

pub const NO_MORE_RETRIES: &str = "No more retries left";
pub const MAX_DURATION_EXCEEDED: &str = "Max duration limit exceeded";

#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("invalid retry limit '{0}'")]
    InvalidLimit(String),

    #[error("invalid backoff factor '{0}'")]
    InvalidFactor(String),

    #[error("invalid backoff duration: {0}")]
    InvalidDuration(#[from] weft_types::error::DurationError),
}

fn int_value(value: &IntOrString) -> Option<i64> {
    match value {
        IntOrString::Int(i) => Some(*i),
        IntOrString::String(s) => s.trim().parse().ok(),
    }
}

/// Resolve an already-substituted strategy into concrete numbers.
pub fn resolve_strategy(strategy: &RetryStrategy) -> Result<ResolvedRetry, RetryError> {
    let limit = match &strategy.limit {
        None => None,
        Some(raw) => {
            let n = int_value(raw)
                .filter(|n| *n >= 0)
                .ok_or_else(|| RetryError::InvalidLimit(raw.to_string()))?;
            Some(u32::try_from(n).map_err(|_| RetryError::InvalidLimit(raw.to_string()))?)
        }
    };

    let mut resolved = ResolvedRetry {
        limit,
        policy: strategy.retry_policy.unwrap_or_default(),
        backoff_seconds: None,
        factor: 1,
        max_duration_seconds: None,
    };

    if let Some(backoff) = &strategy.backoff {
        if let Some(d) = &backoff.duration {
            resolved.backoff_seconds = Some(parse_duration(d)?.as_secs());
        }
        if let Some(f) = &backoff.factor {
            let factor = int_value(f)
                .filter(|n| *n >= 1)
                .ok_or_else(|| RetryError::InvalidFactor(f.to_string()))?;
            resolved.factor =
                u32::try_from(factor).map_err(|_| RetryError::InvalidFactor(f.to_string()))?;
        }
        if let Some(d) = &backoff.max_duration {
            resolved.max_duration_seconds = Some(parse_duration(d)?.as_secs());
        }
    }
    Ok(resolved)
}

/// Whether `policy` permits retrying an attempt that ended in `phase`.
pub fn policy_permits(
    policy: RetryPolicy,
    phase: NodePhase,
    message: &str,
    config: &ControllerConfig,
) -> bool {
    match policy {
        RetryPolicy::Always => phase.failed_or_error(),
        RetryPolicy::OnFailure => phase == NodePhase::Failed,
        RetryPolicy::OnError => phase == NodePhase::Error,
        RetryPolicy::OnTransientError => {
            phase == NodePhase::Error
                || (phase == NodePhase::Failed && config.is_transient(message))
        }
    }
}

/// Delay before attempt number `attempt` (1-based retry count).
pub fn backoff_delay(retry: &ResolvedRetry, attempt: u32) -> Option<Duration> {
    let base = retry.backoff_seconds?;
    let exponent = attempt.saturating_sub(1);
    let multiplier = u64::from(retry.factor).saturating_pow(exponent);
    Some(Duration::from_secs(base.saturating_mul(multiplier)))
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Last attempt succeeded; the retry node succeeds with it.
    Succeeded,
    /// Launch the next attempt now.
    Retry,
    /// Wait until `until` before the next attempt.
    Backoff {
        until: DateTime<Utc>,
        message: String,
    },
    /// Policy does not cover this outcome; adopt the attempt's phase as-is.
    NotRetryable,
    /// Budget used up; adopt the attempt's phase with `reason` appended.
    Exhausted { reason: &'static str },
}

/// Decide what happens after the most recent attempt fulfilled.
///
/// `attempts` counts the attempts created so far, including `last`.
pub fn decide(
    retry: &ResolvedRetry,
    attempts: usize,
    last: &Node,
    retry_started: DateTime<Utc>,
    now: DateTime<Utc>,
    config: &ControllerConfig,
) -> RetryDecision {
    if last.phase.successful() {
        return RetryDecision::Succeeded;
    }
    if !policy_permits(retry.policy, last.phase, &last.message, config) {
        return RetryDecision::NotRetryable;
    }
    let retries_used = attempts.saturating_sub(1);
    if retry.limit.is_some_and(|limit| retries_used >= limit as usize) {
        return RetryDecision::Exhausted {
            reason: NO_MORE_RETRIES,
        };
    }

    let deadline = retry
        .max_duration_seconds
        .map(|secs| retry_started + chrono::Duration::seconds(secs as i64));
    if deadline.is_some_and(|d| now >= d) {
        return RetryDecision::Exhausted {
            reason: MAX_DURATION_EXCEEDED,
        };
    }

    let next_retry = u32::try_from(attempts).unwrap_or(u32::MAX);
    let Some(delay) = backoff_delay(retry, next_retry) else {
        return RetryDecision::Retry;
    };
    let finished = last.finished_at.unwrap_or(now);
    let until = finished + chrono::Duration::seconds(delay.as_secs() as i64);
    if deadline.is_some_and(|d| until > d) {
        return RetryDecision::Exhausted {
            reason: MAX_DURATION_EXCEEDED,
        };
    }
    if now < until {
        return RetryDecision::Backoff {
            until,
            message: format!("Backoff for {}", format_duration(delay)),
        };
    }
    RetryDecision::Retry
}

/// Message for a retry node that gave up after `last` failed.
pub fn exhausted_message(last_message: &str, reason: &str) -> String {
    if last_message.is_empty() {
        reason.to_string()
    } else {
        format!("{last_message} ({reason})")
    }
}
