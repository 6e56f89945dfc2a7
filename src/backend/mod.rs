//! Capability traits for the execution backend.
//!
//! The validator never runs an EVM of its own. Everything it needs from the
//! L2 node — blocks, receipts, historical state, traced re-execution, and the
//! chain's key-value store — is expressed here as trait surfaces so the proof
//! core can be driven against a deterministic mock in tests and against the
//! embedding node in production.

use std::sync::Arc;

use alloy_consensus::{Header, ReceiptEnvelope, TxEnvelope};
use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use thiserror::Error;

use crate::proof::{ProofError, StepTracer};

/// The L2 block shape consumed by the proof core: a consensus header plus
/// full transaction envelopes.
pub type L2Block = alloy_consensus::Block<TxEnvelope>;

/// Convenience accessor for a block's hash.
pub fn block_hash(block: &L2Block) -> B256 {
    block.header.hash_slow()
}

/// Outcome of re-executing one transaction.
#[derive(Debug, Clone, Copy)]
pub struct TxExecution {
    /// Gas consumed by the transaction, refunds applied.
    pub gas_used: u64,
}

/// The slice of the L2 chain configuration the validator consumes.
///
/// The full configuration lives behind the backend (the replay machinery
/// needs it); only the identity surfaces here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainConfig {
    /// The L2 chain id.
    pub chain_id: u64,
}

/// A scoped handle onto the L2 state at a particular point of execution.
///
/// The handle is mutated by [`Backend::execute_transaction`]; it is consumed
/// by a single materialization or proving run and then released.
pub trait StateHandle: Send {
    /// Root of the global account state as currently committed.
    fn state_root(&self) -> B256;

    /// Commitment over the state accesses recorded since the last
    /// [`prepare`](StateHandle::prepare).
    fn access_root(&self) -> B256;

    /// Clears the access tracking for the given transaction position.
    fn prepare(&mut self, tx_hash: B256, block_hash: B256, tx_index: usize);

    /// Whether the account at `address` carries contract code.
    fn has_code(&self, address: Address) -> bool;

    /// Type-erased escape hatch: [`Backend::execute_transaction`] downcasts
    /// the handle back to the backend's concrete state.
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

/// Failure of the chain's key-value store.
#[derive(Debug, Error)]
#[error("key-value store error: {0}")]
pub struct KvError(pub String);

/// Schema-free byte store supplied by the backend's chain database.
///
/// The validator keeps exactly one entry in it (the persisted challenge
/// context), so the surface is deliberately minimal.
pub trait KeyValueStore: Send + Sync {
    /// Reads the value under `key`, if present.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError>;

    /// Writes `value` under `key`, replacing any previous value.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KvError>;

    /// Deletes the value under `key`. Deleting a missing key is not an error.
    fn delete(&self, key: &[u8]) -> Result<(), KvError>;
}

/// Read and replay surface the L2 node must provide.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Returns the block at `number` with full transactions.
    async fn block_by_number(&self, number: u64) -> Result<Arc<L2Block>, ProofError>;

    /// Returns the header at `number`.
    async fn header_by_number(&self, number: u64) -> Result<Header, ProofError>;

    /// Returns the receipts of the block with the given hash.
    async fn receipts(&self, block_hash: B256) -> Result<Vec<ReceiptEnvelope>, ProofError>;

    /// Returns the hashes of up to the last 256 ancestors of block `number`,
    /// oldest first. This is the window the EVM exposes through `BLOCKHASH`.
    async fn recent_block_hashes(&self, number: u64) -> Result<Vec<B256>, ProofError>;

    /// Returns the L1 timestamp recorded when transaction `tx_index` of
    /// `block` was enqueued.
    ///
    /// Verification contexts are pinned to the transaction's L1-origin time,
    /// not the L2 block time; the consensus envelope does not carry it, so
    /// the node supplies it from its enqueue metadata.
    async fn l1_timestamp(&self, block: &L2Block, tx_index: usize) -> Result<u64, ProofError>;

    /// Returns the state at the end of `block`, re-executing at most `reexec`
    /// ancestors to rebuild it if it was pruned.
    async fn state_at_block(
        &self,
        block: &L2Block,
        reexec: u64,
    ) -> Result<Box<dyn StateHandle>, ProofError>;

    /// Returns the state immediately before transaction `tx_index` of
    /// `block`, re-executing the leading transactions of the block.
    async fn state_at_transaction(
        &self,
        block: &L2Block,
        tx_index: usize,
        reexec: u64,
    ) -> Result<Box<dyn StateHandle>, ProofError>;

    /// Re-executes transaction `tx_index` of `block` on top of `state`,
    /// invoking `tracer` after every EVM step. The state handle is left at
    /// the post-transaction state.
    ///
    /// A transaction that never enters the interpreter (a plain EOA value
    /// transfer) produces no tracer callbacks.
    async fn execute_transaction(
        &self,
        state: &mut dyn StateHandle,
        block: &L2Block,
        tx_index: usize,
        tracer: &mut dyn StepTracer,
    ) -> Result<TxExecution, ProofError>;

    /// The chain's configuration.
    fn chain_config(&self) -> ChainConfig;

    /// The chain's local key-value store.
    fn chain_db(&self) -> Arc<dyn KeyValueStore>;
}
