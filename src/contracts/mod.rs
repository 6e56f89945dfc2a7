//! L1 contract bindings and client traits.
//!
//! Each contract surface is a `sol!`-generated binding wrapped in an async
//! trait so the loops can be driven against mocks. The concrete clients talk
//! to a websocket provider with a local wallet filler and forward contract
//! events into caller-provided bounded channels.

pub mod challenge;
pub mod rollup;

use thiserror::Error;

pub use challenge::{
    BisectedEvent, ChallengeClient, ChallengeCompletedEvent, ChallengeContractManager,
    ChallengeManager,
};
pub use rollup::{
    AssertionChallengedEvent, AssertionCreatedEvent, AssertionState, ChallengeContextState,
    RollupClient, RollupContractClient, StakerStatus, Zombie,
};

/// Errors of the contract clients.
#[derive(Debug, Error)]
pub enum ContractError {
    /// Provider construction or connection failure.
    #[error("provider error: {0}")]
    Provider(String),

    /// A read-only contract call failed.
    #[error("contract call failed: {0}")]
    Call(String),

    /// A transaction could not be submitted or confirmed.
    #[error("submission failed: {0}")]
    Submission(String),

    /// A submitted transaction reverted on-chain.
    #[error("transaction reverted: {0}")]
    Reverted(String),

    /// Event subscription setup failed.
    #[error("subscription failed: {0}")]
    Subscription(String),
}

impl ContractError {
    /// Whether the error is a definitive on-chain revert (not worth
    /// retrying) rather than transport trouble.
    pub fn is_revert(&self) -> bool {
        match self {
            Self::Reverted(_) => true,
            Self::Submission(msg) | Self::Call(msg) => msg.contains("revert"),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revert_classification() {
        assert!(ContractError::Reverted("advanceStake(3)".into()).is_revert());
        assert!(ContractError::Submission("execution reverted: stale".into()).is_revert());
        assert!(!ContractError::Submission("connection reset".into()).is_revert());
        assert!(!ContractError::Provider("dial failed".into()).is_revert());
    }
}
