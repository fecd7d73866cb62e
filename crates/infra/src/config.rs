//! Ledger configuration, read from the environment.
//!
//! | Variable | Default |
//! |---|---|
//! | `RELIEFOPS_MAX_CONFLICT_RETRIES` | `3` |
//! | `RELIEFOPS_FULFILLMENT_SHORTFALL` (`clamp` / `reject`) | `clamp` |
//! | `RELIEFOPS_STRICT_REQUEST_TRANSITIONS` | `true` |
//! | `RELIEFOPS_RECENT_TRANSACTIONS_LIMIT` | `10` |
//! | `DATABASE_URL` | unset (in-memory store) |

use core::str::FromStr;

use thiserror::Error;

use reliefops_inventory::{ShortfallPolicy, TransitionMode};

pub const MAX_CONFLICT_RETRIES: &str = "RELIEFOPS_MAX_CONFLICT_RETRIES";
pub const FULFILLMENT_SHORTFALL: &str = "RELIEFOPS_FULFILLMENT_SHORTFALL";
pub const STRICT_REQUEST_TRANSITIONS: &str = "RELIEFOPS_STRICT_REQUEST_TRANSITIONS";
pub const RECENT_TRANSACTIONS_LIMIT: &str = "RELIEFOPS_RECENT_TRANSACTIONS_LIMIT";
pub const DATABASE_URL: &str = "DATABASE_URL";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerConfig {
    /// Reload-and-redecide attempts after an optimistic concurrency conflict.
    pub max_conflict_retries: u32,
    /// Applied when a fulfillment exceeds available stock.
    pub fulfillment_shortfall: ShortfallPolicy,
    /// Enforce the request transition table.
    pub strict_request_transitions: bool,
    /// Transactions shown with a resource detail.
    pub recent_transactions_limit: u32,
    pub database_url: Option<String>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
            fulfillment_shortfall: ShortfallPolicy::Clamp,
            strict_request_transitions: true,
            recent_transactions_limit: 10,
            database_url: None,
        }
    }
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            max_conflict_retries: parse_or(&lookup, MAX_CONFLICT_RETRIES, defaults.max_conflict_retries)?,
            fulfillment_shortfall: parse_or(&lookup, FULFILLMENT_SHORTFALL, defaults.fulfillment_shortfall)?,
            strict_request_transitions: match lookup(STRICT_REQUEST_TRANSITIONS) {
                Some(raw) => parse_bool(STRICT_REQUEST_TRANSITIONS, &raw)?,
                None => defaults.strict_request_transitions,
            },
            recent_transactions_limit: parse_or(
                &lookup,
                RECENT_TRANSACTIONS_LIMIT,
                defaults.recent_transactions_limit,
            )?,
            database_url: lookup(DATABASE_URL).filter(|url| !url.trim().is_empty()),
        })
    }

    pub fn transition_mode(&self) -> TransitionMode {
        if self.strict_request_transitions {
            TransitionMode::Strict
        } else {
            TransitionMode::Permissive
        }
    }
}

fn parse_or<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn unset_environment_gives_defaults() {
        assert_eq!(LedgerConfig::from_lookup(lookup(&[])).unwrap(), LedgerConfig::default());
    }

    #[test]
    fn reads_every_key() {
        let config = LedgerConfig::from_lookup(lookup(&[
            (MAX_CONFLICT_RETRIES, "7"),
            (FULFILLMENT_SHORTFALL, "reject"),
            (STRICT_REQUEST_TRANSITIONS, "false"),
            (RECENT_TRANSACTIONS_LIMIT, "25"),
            (DATABASE_URL, "postgres://localhost/relief"),
        ]))
        .unwrap();

        assert_eq!(config.max_conflict_retries, 7);
        assert_eq!(config.fulfillment_shortfall, ShortfallPolicy::Reject);
        assert_eq!(config.transition_mode(), TransitionMode::Permissive);
        assert_eq!(config.recent_transactions_limit, 25);
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/relief"));
    }

    #[test]
    fn malformed_values_are_errors() {
        let err = LedgerConfig::from_lookup(lookup(&[(FULFILLMENT_SHORTFALL, "ignore")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: FULFILLMENT_SHORTFALL, .. }));

        assert!(LedgerConfig::from_lookup(lookup(&[(MAX_CONFLICT_RETRIES, "-1")])).is_err());
        assert!(LedgerConfig::from_lookup(lookup(&[(STRICT_REQUEST_TRANSITIONS, "maybe")])).is_err());
    }
}
