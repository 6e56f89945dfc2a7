//! Constants used throughout the validator.

use std::time::Duration;

/// Capacity of every L1 event fan-in channel. Overflow means the consumer
/// stalled for thousands of L1 events and is treated as fatal.
pub const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Number of blocks the prover is willing to re-execute to rebuild missing
/// historical state for a trace.
pub const DEFAULT_REEXEC: u64 = 128;

/// Number of blocks the EVM can look back for blockhashes.
pub const BLOCKHASH_WINDOW: usize = 256;

/// Delay before retrying a failed L1/L2 RPC interaction in a loop handler.
pub const RPC_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Delay before retrying a failed key-value store interaction.
pub const STORE_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Key of the persisted challenge context in the chain's key-value store.
pub const CHALLENGE_CTX_KEY: &[u8] = b"fp_validator_challenge_ctx";

/// Default number of attempts for an L1 submission before giving up.
pub const DEFAULT_SUBMIT_ATTEMPTS: usize = 3;
