//! Error types for state materialization and proof generation.

use thiserror::Error;

/// Errors produced by the execution backend, the state materializer, and the
/// one-step prover.
#[derive(Debug, Error)]
pub enum ProofError {
    /// A block in the requested range does not exist on the L2 chain.
    #[error("block #{0} not found")]
    BadBlock(u64),

    /// The requested block range is empty or starts at genesis.
    #[error("invalid block range [{start}, {end})")]
    InvalidRange {
        /// First block of the half-open range.
        start: u64,
        /// End of the half-open range (exclusive).
        end: u64,
    },

    /// Re-execution of a transaction diverged from the canonical result.
    #[error("tracing failed: {0}")]
    TraceError(String),

    /// Historical state could not be rebuilt within the re-execution window.
    #[error("state unavailable for block #{block} (reexec window {reexec})")]
    StateUnavailable {
        /// Block whose post-state was requested.
        block: u64,
        /// Re-execution window that was exhausted.
        reexec: u64,
    },

    /// The start state handed to the prover is malformed.
    #[error("bad start state: {0}")]
    BadStartState(&'static str),
}
