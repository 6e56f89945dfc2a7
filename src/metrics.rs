//! Metric names and recording helpers.
//!
//! Recording goes through the `metrics` facade; installing a recorder and
//! exposing it over HTTP is the embedder's job. Every helper is a no-op when
//! no recorder is installed.

use alloy_primitives::U256;

/// Gauge: id of the newest assertion observed on L1.
pub const ASSERTION_INDEX: &str = "fp_validator_assertion_index";

/// Gauge: inbox size of the newest assertion observed on L1.
pub const ASSERTION_SIZE: &str = "fp_validator_assertion_size";

/// Gauge: highest assertion id we verified and advanced onto.
pub const VERIFIED_INDEX: &str = "fp_validator_verified_index";

/// Gauge: fee of the last advance-stake transaction, in wei.
pub const VERIFY_FEE_WEI: &str = "fp_validator_verify_fee_wei";

/// Gauge: stake-address balance, in wei.
pub const BALANCE_WEI: &str = "fp_validator_balance_wei";

/// Counter: challenges opened by this validator.
pub const CHALLENGES_TOTAL: &str = "fp_validator_challenges_total";

/// Records the head assertion observed on L1.
pub fn record_assertion_observed(id: U256, inbox_size: U256) {
    metrics::gauge!(ASSERTION_INDEX).set(u256_to_f64(id));
    metrics::gauge!(ASSERTION_SIZE).set(u256_to_f64(inbox_size));
}

/// Records a successful stake advancement and its fee.
pub fn record_advanced(id: u64, fee_wei: u128) {
    metrics::gauge!(VERIFIED_INDEX).set(id as f64);
    metrics::gauge!(VERIFY_FEE_WEI).set(fee_wei as f64);
}

/// Records the stake-address balance.
pub fn record_balance(wei: U256) {
    metrics::gauge!(BALANCE_WEI).set(u256_to_f64(wei));
}

/// Records the start of a challenge.
pub fn record_challenge_opened() {
    metrics::counter!(CHALLENGES_TOTAL).increment(1);
}

fn u256_to_f64(value: U256) -> f64 {
    value.saturating_to::<u64>() as f64
}
