//! Configuration types and validation for the validator.

use std::time::Duration;

use alloy_primitives::{Address, U256};
use backon::ExponentialBuilder;
use thiserror::Error;
use url::Url;

use crate::constants::{DEFAULT_REEXEC, DEFAULT_SUBMIT_ATTEMPTS};

/// Errors that can occur during configuration validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Invalid URL format.
    #[error("invalid {field} URL: {reason}")]
    InvalidUrl {
        /// The field name that contains the invalid URL.
        field: &'static str,
        /// The reason the URL is invalid.
        reason: String,
    },
    /// A field value is out of the allowed range.
    #[error("{field} must be {constraint}, got {value}")]
    OutOfRange {
        /// The field name that is out of range.
        field: &'static str,
        /// The constraint description.
        constraint: &'static str,
        /// The actual value.
        value: String,
    },
    /// Invalid metrics configuration.
    #[error("invalid metrics config: {0}")]
    Metrics(String),
}

/// Validated validator configuration.
///
/// Loading (CLI, env, files) is the embedder's concern; validation is not.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Websocket endpoint of the L1 node.
    pub l1_endpoint: Url,
    /// Endpoint of the L2 node, carried for the embedder's wiring.
    pub l2_endpoint: Url,
    /// Address of the Rollup contract on L1.
    pub rollup_addr: Address,
    /// Our staking address; also the transaction sender.
    pub stake_addr: Address,
    /// The sequencer's staking address, the default challenge defendant.
    pub sequencer_addr: Address,
    /// Bond posted when staking for the first time.
    pub stake_amount: U256,
    /// Number of ancestor blocks re-executed to rebuild pruned state.
    pub reexec: u64,
    /// Whether metric recording is enabled.
    pub metrics_enable: bool,
    /// Metrics exposition host, consumed by the embedder.
    pub metrics_host: String,
    /// Metrics exposition port, consumed by the embedder.
    pub metrics_port: u16,
    /// Retry policy for L1 submissions.
    pub retry: RetryConfig,
}

impl ValidatorConfig {
    /// Checks field-level consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_url(&self.l1_endpoint, "l1-endpoint")?;
        validate_url(&self.l2_endpoint, "l2-endpoint")?;

        if self.reexec == 0 {
            return Err(ConfigError::OutOfRange {
                field: "reexec",
                constraint: "greater than 0",
                value: "0".to_string(),
            });
        }

        if self.stake_amount.is_zero() {
            return Err(ConfigError::OutOfRange {
                field: "stake-amount",
                constraint: "greater than 0",
                value: "0".to_string(),
            });
        }

        if self.metrics_enable && self.metrics_port == 0 {
            return Err(ConfigError::Metrics(
                "metrics port must be non-zero when metrics are enabled".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            l1_endpoint: Url::parse("ws://127.0.0.1:8546").expect("static url"),
            l2_endpoint: Url::parse("http://127.0.0.1:9545").expect("static url"),
            rollup_addr: Address::ZERO,
            stake_addr: Address::ZERO,
            sequencer_addr: Address::ZERO,
            stake_amount: U256::from(1_000_000_000_000_000_000u128),
            reexec: DEFAULT_REEXEC,
            metrics_enable: false,
            metrics_host: "0.0.0.0".to_string(),
            metrics_port: 9190,
            retry: RetryConfig::default(),
        }
    }
}

/// Validate that a URL has a scheme and host.
fn validate_url(url: &Url, field: &'static str) -> Result<(), ConfigError> {
    if url.scheme().is_empty() {
        return Err(ConfigError::InvalidUrl {
            field,
            reason: "missing scheme".to_string(),
        });
    }
    if url.host().is_none() {
        return Err(ConfigError::InvalidUrl {
            field,
            reason: "missing host".to_string(),
        });
    }
    Ok(())
}

/// Retry policy for L1 transaction submission.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: usize,
    /// Delay before the first retry.
    pub min_delay: Duration,
    /// Upper bound on the backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_SUBMIT_ATTEMPTS,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Converts the policy into a backon builder.
    pub fn to_backoff_builder(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_attempts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        ValidatorConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_reexec_is_rejected() {
        let config = ValidatorConfig {
            reexec: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { field: "reexec", .. })
        ));
    }

    #[test]
    fn zero_stake_amount_is_rejected() {
        let config = ValidatorConfig {
            stake_amount: U256::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange {
                field: "stake-amount",
                ..
            })
        ));
    }

    #[test]
    fn metrics_port_zero_only_matters_when_enabled() {
        let mut config = ValidatorConfig {
            metrics_enable: true,
            metrics_port: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Metrics(_))));

        config.metrics_enable = false;
        config.validate().unwrap();
    }

    #[test]
    fn url_without_host_is_rejected() {
        let config = ValidatorConfig {
            l1_endpoint: Url::parse("file:///tmp/socket").unwrap(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidUrl {
                field: "l1-endpoint",
                ..
            })
        ));
    }
}
