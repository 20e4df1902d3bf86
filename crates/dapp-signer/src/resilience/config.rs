use super::error::InvalidResilienceConfigError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{str::FromStr, time::Duration};

pub const MAX_RETRIES_LIMIT: i64 = 10;
pub const MIN_GAS_MULTIPLIER: f64 = 1.0;
pub const MAX_GAS_MULTIPLIER: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

impl FromStr for BackoffStrategy {
    type Err = InvalidResilienceConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(Self::Fixed),
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            other => Err(InvalidResilienceConfigError::new(
                "backoff",
                other,
                "must be one of fixed, linear, exponential",
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Retries after the first attempt. Valid range 0..=10.
    pub max_retries: i64,
    pub initial_delay_ms: i64,
    pub max_delay_ms: i64,
    pub backoff: BackoffStrategy,
    /// Applied to the gas limits after an out-of-gas failure. Valid range 1.0..=3.0.
    pub gas_multiplier: f64,
    /// Switch to `fallback_paymaster_url` once when the sender cannot pay for gas.
    pub fallback_to_sponsored: bool,
    pub fallback_paymaster_url: Option<String>,
    /// Upper bound on a single attempt (submit + wait).
    pub timeout_seconds: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff: BackoffStrategy::Exponential,
            gas_multiplier: 1.2,
            fallback_to_sponsored: false,
            fallback_paymaster_url: None,
            timeout_seconds: 60,
        }
    }
}

impl ResilienceConfig {
    pub fn validate(&self) -> Result<(), InvalidResilienceConfigError> {
        if !(0..=MAX_RETRIES_LIMIT).contains(&self.max_retries) {
            return Err(InvalidResilienceConfigError::new(
                "maxRetries",
                self.max_retries,
                "must be an integer between 0 and 10",
            ));
        }
        if self.initial_delay_ms < 0 {
            return Err(InvalidResilienceConfigError::new(
                "initialDelayMs",
                self.initial_delay_ms,
                "must be >= 0",
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(InvalidResilienceConfigError::new(
                "maxDelayMs",
                self.max_delay_ms,
                "must be >= initialDelayMs",
            ));
        }
        if !(MIN_GAS_MULTIPLIER..=MAX_GAS_MULTIPLIER).contains(&self.gas_multiplier) {
            return Err(InvalidResilienceConfigError::new(
                "gasMultiplier",
                self.gas_multiplier,
                "must be between 1 and 3",
            ));
        }
        let has_paymaster = self
            .fallback_paymaster_url
            .as_deref()
            .is_some_and(|u| !u.trim().is_empty());
        if self.fallback_to_sponsored && !has_paymaster {
            return Err(InvalidResilienceConfigError::new(
                "fallbackPaymasterUrl",
                self.fallback_paymaster_url.as_deref().unwrap_or("<unset>"),
                "required when fallbackToSponsored is true",
            ));
        }
        if self.timeout_seconds == 0 {
            return Err(InvalidResilienceConfigError::new(
                "timeoutSeconds",
                self.timeout_seconds,
                "must be > 0",
            ));
        }
        Ok(())
    }

    /// Parse a dapp-supplied `resilience` object (camelCase keys, missing keys take defaults)
    /// and validate it.
    pub fn from_json(v: &Value) -> Result<Self, InvalidResilienceConfigError> {
        let Some(obj) = v.as_object() else {
            return Err(InvalidResilienceConfigError::new(
                "resilience",
                v,
                "must be an object",
            ));
        };
        let mut cfg = Self::default();

        if let Some(n) = obj.get("maxRetries") {
            cfg.max_retries = json_integer(n).ok_or_else(|| {
                InvalidResilienceConfigError::new(
                    "maxRetries",
                    n,
                    "must be an integer between 0 and 10",
                )
            })?;
        }
        if let Some(n) = obj.get("initialDelayMs") {
            cfg.initial_delay_ms = json_integer(n).ok_or_else(|| {
                InvalidResilienceConfigError::new("initialDelayMs", n, "must be a number >= 0")
            })?;
        }
        if let Some(n) = obj.get("maxDelayMs") {
            cfg.max_delay_ms = json_integer(n).ok_or_else(|| {
                InvalidResilienceConfigError::new(
                    "maxDelayMs",
                    n,
                    "must be a number >= initialDelayMs",
                )
            })?;
        }
        if let Some(n) = obj.get("gasMultiplier") {
            cfg.gas_multiplier = n.as_f64().ok_or_else(|| {
                InvalidResilienceConfigError::new("gasMultiplier", n, "must be between 1 and 3")
            })?;
        }
        if let Some(b) = obj.get("fallbackToSponsored") {
            cfg.fallback_to_sponsored = b.as_bool().ok_or_else(|| {
                InvalidResilienceConfigError::new("fallbackToSponsored", b, "must be a boolean")
            })?;
        }
        if let Some(u) = obj.get("fallbackPaymasterUrl") {
            cfg.fallback_paymaster_url = u.as_str().map(str::to_owned);
        }
        if let Some(b) = obj.get("backoff") {
            cfg.backoff = b.as_str().map_or_else(
                || {
                    Err(InvalidResilienceConfigError::new(
                        "backoff",
                        b,
                        "must be one of fixed, linear, exponential",
                    ))
                },
                BackoffStrategy::from_str,
            )?;
        }
        if let Some(n) = obj.get("timeoutSeconds") {
            cfg.timeout_seconds = n.as_u64().ok_or_else(|| {
                InvalidResilienceConfigError::new("timeoutSeconds", n, "must be > 0")
            })?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Integers only: `2` and `2.0` are accepted, `2.5` is not.
fn json_integer(v: &Value) -> Option<i64> {
    if let Some(i) = v.as_i64() {
        return Some(i);
    }
    let f = v.as_f64()?;
    if f.fract() != 0.0 || !f.is_finite() {
        return None;
    }
    #[expect(clippy::cast_possible_truncation, reason = "checked integral above")]
    let i = f as i64;
    Some(i)
}

/// Delay before the retry that follows failed attempt `attempt` (1-based).
pub fn calculate_backoff_delay(
    attempt: u32,
    strategy: BackoffStrategy,
    initial_delay_ms: u64,
    max_delay_ms: u64,
) -> Duration {
    let attempt = attempt.max(1);
    let ms = match strategy {
        BackoffStrategy::Fixed => initial_delay_ms,
        BackoffStrategy::Linear => initial_delay_ms.saturating_mul(u64::from(attempt)),
        BackoffStrategy::Exponential => {
            let shift = (attempt - 1).min(32);
            let pow2 = 1_u64.checked_shl(shift).unwrap_or(u64::MAX);
            let raw = initial_delay_ms.saturating_mul(pow2).min(max_delay_ms);
            apply_jitter(raw).min(max_delay_ms)
        }
    };
    Duration::from_millis(ms)
}

/// Uniform jitter within +/-10%.
fn apply_jitter(ms: u64) -> u64 {
    if ms == 0 {
        return 0;
    }
    // Avoid holding a non-Send RNG across await points.
    let step = rand::random::<u64>() % 201;
    let spread = ms / 10;
    let offset = spread.saturating_mul(step) / 100;
    ms.saturating_sub(spread).saturating_add(offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_valid() {
        assert!(ResilienceConfig::default().validate().is_ok());
        assert!(ResilienceConfig::from_json(&json!({})).is_ok());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let bad = [
            (json!({ "maxRetries": -1 }), "maxRetries"),
            (json!({ "maxRetries": 11 }), "maxRetries"),
            (json!({ "maxRetries": 2.5 }), "maxRetries"),
            (
                json!({ "initialDelayMs": 5000, "maxDelayMs": 1000 }),
                "maxDelayMs",
            ),
            (json!({ "initialDelayMs": -5 }), "initialDelayMs"),
            (json!({ "gasMultiplier": 0.5 }), "gasMultiplier"),
            (json!({ "gasMultiplier": 3.5 }), "gasMultiplier"),
            (json!({ "fallbackToSponsored": true }), "fallbackPaymasterUrl"),
            (
                json!({ "fallbackToSponsored": true, "fallbackPaymasterUrl": "  " }),
                "fallbackPaymasterUrl",
            ),
            (json!({ "backoff": "random" }), "backoff"),
        ];
        for (v, field) in bad {
            let err = ResilienceConfig::from_json(&v).err();
            assert_eq!(err.map(|e| e.field), Some(field), "{v}");
        }
    }

    #[test]
    fn accepts_integral_floats_and_sponsored_fallback() {
        let cfg = ResilienceConfig::from_json(&json!({
            "maxRetries": 2.0,
            "fallbackToSponsored": true,
            "fallbackPaymasterUrl": "https://paymaster.example",
            "backoff": "linear",
        }));
        let cfg = cfg.ok();
        assert_eq!(cfg.as_ref().map(|c| c.max_retries), Some(2));
        assert_eq!(cfg.map(|c| c.backoff), Some(BackoffStrategy::Linear));
    }

    #[test]
    fn fixed_and_linear_are_exact() {
        for attempt in 1..=10 {
            assert_eq!(
                calculate_backoff_delay(attempt, BackoffStrategy::Fixed, 250, 1_000),
                Duration::from_millis(250)
            );
            assert_eq!(
                calculate_backoff_delay(attempt, BackoffStrategy::Linear, 250, 1_000),
                Duration::from_millis(250 * u64::from(attempt))
            );
        }
    }

    #[test]
    fn exponential_stays_within_jitter_band() {
        let (base, max) = (100_u64, 5_000_u64);
        for attempt in 1..=12_u32 {
            let expected = (base << (attempt - 1)).min(max);
            for _ in 0..50 {
                let got = calculate_backoff_delay(attempt, BackoffStrategy::Exponential, base, max);
                let ms = u64::try_from(got.as_millis()).unwrap_or(u64::MAX);
                assert!(ms >= expected - expected / 10, "attempt {attempt}: {ms}");
                assert!(ms <= expected + expected / 10, "attempt {attempt}: {ms}");
                assert!(ms <= max);
            }
        }
    }
}
