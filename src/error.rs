//! Top-level error type for the validator.

use thiserror::Error;

use crate::bisection::BisectionError;
use crate::contracts::ContractError;
use crate::proof::ProofError;
use crate::rpc::RpcError;
use crate::store::StoreError;

/// Main error type for the validator service.
#[derive(Debug, Error)]
pub enum ValidatorError {
    /// L1 RPC failure.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Contract interaction failure.
    #[error(transparent)]
    Contract(#[from] ContractError),

    /// State materialization or proof generation failure.
    #[error(transparent)]
    Proof(#[from] ProofError),

    /// Responder decision failure.
    #[error(transparent)]
    Bisection(#[from] BisectionError),

    /// Durable store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

/// Result type alias for validator operations.
pub type ValidatorResult<T> = Result<T, ValidatorError>;
