//! Retry policy resolution and backoff computation.
//!
//! Retries are configured in three layers: a global default set on the
//! queue, a per-worker override, and a per-job override passed at enqueue
//! time. Each layer is a partial [`RetryPolicy`]; [`RetryConfig::resolve`]
//! merges them over the built-in defaults at submission time, so a bad
//! config fails the `enqueue` call instead of surfacing mid-retry.

use serde::de::{self, Deserializer};
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_EXPONENT: u32 = 4;
pub const DEFAULT_DELAY_MS: u64 = 250;
pub const DEFAULT_MAX_DELAY_MS: u64 = 3_600_000;
pub const DEFAULT_MAX_ATTEMPTS: u64 = 5;

/// A count or duration bound that may be switched off entirely.
///
/// Deserializes from a non-negative JSON number or the string
/// `"unbounded"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Finite(u64),
    Unbounded,
}

impl Limit {
    pub fn is_unbounded(&self) -> bool {
        matches!(self, Limit::Unbounded)
    }
}

impl From<u64> for Limit {
    fn from(n: u64) -> Self {
        Limit::Finite(n)
    }
}

impl<'de> Deserialize<'de> for Limit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Word(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Limit::Finite(n)),
            Raw::Word(w) if w == "unbounded" => Ok(Limit::Unbounded),
            Raw::Word(w) => Err(de::Error::custom(format!(
                "expected a non-negative number or \"unbounded\", got \"{w}\""
            ))),
        }
    }
}

/// A partial retry override. Fields left as `None` inherit from the
/// previous layer (ultimately the built-in defaults).
///
/// The shorthand constructors mirror the accepted config forms:
/// [`RetryPolicy::no_retry`], [`RetryPolicy::immediately`],
/// [`RetryPolicy::immediately_limited`], [`RetryPolicy::fixed`] and
/// [`RetryPolicy::fixed_limited`]. When deserialized, a policy is either
/// the string `"no_retry"` / `"immediately"` or a map of the four fields;
/// unknown keys and negative numbers are rejected.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: Option<Limit>,
    pub delay: Option<u64>,
    pub exponent: Option<u32>,
    pub max_delay: Option<Limit>,
}

impl RetryPolicy {
    /// Never retry: `max_attempts = 0`.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: Some(Limit::Finite(0)),
            ..Self::default()
        }
    }

    /// Retry without waiting: `delay = 0`.
    pub fn immediately() -> Self {
        Self {
            delay: Some(0),
            ..Self::default()
        }
    }

    /// Retry without waiting, at most `max_attempts` times.
    pub fn immediately_limited(max_attempts: u64) -> Self {
        Self {
            delay: Some(0),
            max_attempts: Some(Limit::Finite(max_attempts)),
            ..Self::default()
        }
    }

    /// Constant backoff of `delay_ms` between attempts.
    pub fn fixed(delay_ms: u64) -> Self {
        Self {
            delay: Some(delay_ms),
            exponent: Some(0),
            max_delay: Some(Limit::Unbounded),
            ..Self::default()
        }
    }

    /// Constant backoff of `delay_ms`, at most `max_attempts` times.
    pub fn fixed_limited(delay_ms: u64, max_attempts: u64) -> Self {
        Self {
            max_attempts: Some(Limit::Finite(max_attempts)),
            ..Self::fixed(delay_ms)
        }
    }

    pub fn max_attempts(mut self, limit: impl Into<Limit>) -> Self {
        self.max_attempts = Some(limit.into());
        self
    }

    pub fn delay(mut self, delay_ms: u64) -> Self {
        self.delay = Some(delay_ms);
        self
    }

    pub fn exponent(mut self, exponent: u32) -> Self {
        self.exponent = Some(exponent);
        self
    }

    pub fn max_delay(mut self, limit: impl Into<Limit>) -> Self {
        self.max_delay = Some(limit.into());
        self
    }
}

impl<'de> Deserialize<'de> for RetryPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Fields {
            max_attempts: Option<Limit>,
            delay: Option<u64>,
            exponent: Option<u32>,
            max_delay: Option<Limit>,
        }

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Form {
            Shorthand(String),
            Fields(Fields),
        }

        match Form::deserialize(deserializer)? {
            Form::Shorthand(word) => match word.as_str() {
                "no_retry" => Ok(RetryPolicy::no_retry()),
                "immediately" => Ok(RetryPolicy::immediately()),
                other => Err(de::Error::custom(format!(
                    "unknown retry shorthand \"{other}\""
                ))),
            },
            Form::Fields(f) => Ok(RetryPolicy {
                max_attempts: f.max_attempts,
                delay: f.delay,
                exponent: f.exponent,
                max_delay: f.max_delay,
            }),
        }
    }
}

/// The fully resolved retry configuration for one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: Limit,
    pub delay: u64,
    pub exponent: u32,
    pub max_delay: Limit,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Limit::Finite(DEFAULT_MAX_ATTEMPTS),
            delay: DEFAULT_DELAY_MS,
            exponent: DEFAULT_EXPONENT,
            max_delay: Limit::Finite(DEFAULT_MAX_DELAY_MS),
        }
    }
}

impl RetryConfig {
    /// Merge the three override layers over the defaults. Later layers win
    /// field-by-field; an absent layer (or absent field) preserves the
    /// previous one.
    pub fn resolve(
        global: Option<&RetryPolicy>,
        worker: Option<&RetryPolicy>,
        job: Option<&RetryPolicy>,
    ) -> Self {
        let mut cfg = Self::default();
        for layer in [global, worker, job].into_iter().flatten() {
            cfg.apply(layer);
        }
        cfg
    }

    fn apply(&mut self, policy: &RetryPolicy) {
        if let Some(max_attempts) = policy.max_attempts {
            self.max_attempts = max_attempts;
        }
        if let Some(delay) = policy.delay {
            self.delay = delay;
        }
        if let Some(exponent) = policy.exponent {
            self.exponent = exponent;
        }
        if let Some(max_delay) = policy.max_delay {
            self.max_delay = max_delay;
        }
    }

    /// Whether retry number `attempt` (1-based) is allowed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Limit::Unbounded => true,
            Limit::Finite(max) => u64::from(attempt) <= max,
        }
    }

    /// Backoff before retry number `attempt`: `attempt^exponent * delay`
    /// milliseconds, clamped to `max_delay` when finite.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.delay == 0 {
            return Duration::ZERO;
        }
        let factor = u64::from(attempt).saturating_pow(self.exponent);
        let mut ms = factor.saturating_mul(self.delay);
        if let Limit::Finite(cap) = self.max_delay {
            ms = ms.min(cap);
        }
        Duration::from_millis(ms)
    }
}
