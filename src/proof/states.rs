//! State vector materialization.
//!
//! [`generate_states`] deterministically replays L2 execution over a
//! half-open block range and produces the ordered sequence of hashable
//! execution states the bisection protocol runs over.

use std::sync::Arc;

use alloy_consensus::Transaction;
use alloy_primitives::{B256, U256};
use tracing::info;

use crate::backend::{block_hash, Backend, L2Block, StateHandle};
use crate::constants::DEFAULT_REEXEC;
use crate::proof::error::ProofError;
use crate::proof::state::{BlockHashTree, BlockState, InterState, StateType};
use crate::proof::tracer::IntraStateGenerator;

/// Tuning knobs of the materializer and prover.
#[derive(Debug, Clone, Copy)]
pub struct ProverConfig {
    /// Number of ancestor blocks re-executed to rebuild pruned state.
    pub reexec: u64,
}

impl Default for ProverConfig {
    fn default() -> Self {
        Self {
            reexec: DEFAULT_REEXEC,
        }
    }
}

/// One entry of the bisection domain.
///
/// `vm_hash` alone identifies the state for on-chain comparison; the rest is
/// the context needed to regenerate or prove the state locally.
#[derive(Debug, Clone)]
pub struct ExecutionState {
    /// 32-byte commitment summarizing the VM at this point.
    pub vm_hash: B256,
    /// Gas consumed by the containing block up to this state.
    pub block_gas_used: U256,
    /// Boundary classification of the state.
    pub state_type: StateType,
    /// The carrier block.
    pub block: Arc<L2Block>,
    /// Transaction index within the carrier block (0 for block states).
    pub tx_index: u64,
    /// 1-based EVM step counter within the transaction (0 outside a
    /// transaction).
    pub step_index: u64,
}

impl ExecutionState {
    /// The on-chain identity of the state.
    pub fn hash(&self) -> B256 {
        self.vm_hash
    }
}

/// Captures the block-boundary state at the end of `block` and returns it
/// together with the state handle positioned there.
async fn start_block_state<B: Backend + ?Sized>(
    backend: &B,
    block: &L2Block,
    reexec: u64,
) -> Result<(BlockState, Box<dyn StateHandle>), ProofError> {
    let state = backend.state_at_block(block, reexec).await?;
    let hashes = backend.recent_block_hashes(block.header.number).await?;
    let tree = BlockHashTree::new(hashes);
    let bs = BlockState::from_state(block.header.number, state.as_ref(), &tree);
    Ok((bs, state))
}

/// Materializes the execution states across blocks `[start, end)`.
///
/// For a range covering block A with transactions A1, A2 and an empty block
/// B, the sequence is: the boundary state before A, the inter-state before
/// A1, the intra-states of A1 (none for an EOA transfer), the inter-state
/// before A2, the intra-states of A2, the inter-state after A2, the boundary
/// state of A, the inter-state of empty B, the boundary state of B.
///
/// The first entry's `vm_hash` is the state root committed by `header(start)`
/// and the last entry's is the root committed by `header(end)`; both carry
/// the respective parent as their block.
pub async fn generate_states<B: Backend + ?Sized>(
    backend: &B,
    start: u64,
    end: u64,
    config: &ProverConfig,
) -> Result<Vec<ExecutionState>, ProofError> {
    if start < 1 || end <= start {
        return Err(ProofError::InvalidRange { start, end });
    }

    let mut states = Vec::new();

    let start_parent = backend.block_by_number(start - 1).await?;
    let (_, mut state) = start_block_state(backend, &start_parent, config.reexec).await?;

    let start_header = backend.header_by_number(start).await?;
    states.push(ExecutionState {
        vm_hash: start_header.state_root,
        block_gas_used: U256::ZERO,
        state_type: StateType::Block,
        block: Arc::clone(&start_parent),
        tx_index: 0,
        step_index: 0,
    });
    info!(start, vm_hash = %start_header.state_root, "materializing states");

    for number in start..end {
        let block = backend.block_by_number(number).await?;
        let hashes = backend.recent_block_hashes(number).await?;
        let tree = BlockHashTree::new(hashes);
        let hash = block_hash(&block);
        let transactions = &block.body.transactions;
        let receipts = backend.receipts(hash).await?;

        let mut cumulative_gas = U256::ZERO;

        for (i, tx) in transactions.iter().enumerate() {
            state.prepare(*tx.tx_hash(), hash, i);

            let inter = InterState::from_captured(
                number,
                i as u64,
                state.as_ref(),
                cumulative_gas,
                transactions,
                &receipts,
                &tree,
            );
            states.push(ExecutionState {
                vm_hash: inter.hash(),
                block_gas_used: cumulative_gas,
                state_type: StateType::Inter,
                block: Arc::clone(&block),
                tx_index: i as u64,
                step_index: 0,
            });

            let mut tracer = IntraStateGenerator::new(number, i as u64, &tree);
            let outcome = backend
                .execute_transaction(state.as_mut(), &block, i, &mut tracer)
                .await?;

            let gas_limit = tx.gas_limit();
            for (idx, record) in tracer.into_records().into_iter().enumerate() {
                states.push(ExecutionState {
                    vm_hash: record.vm_hash,
                    block_gas_used: cumulative_gas
                        + U256::from(gas_limit.saturating_sub(record.gas_remaining)),
                    state_type: StateType::Intra,
                    block: Arc::clone(&block),
                    tx_index: i as u64,
                    step_index: idx as u64 + 1,
                });
            }

            cumulative_gas += U256::from(outcome.gas_used);
        }

        let inter = InterState::from_captured(
            number,
            transactions.len() as u64,
            state.as_ref(),
            cumulative_gas,
            transactions,
            &receipts,
            &tree,
        );
        states.push(ExecutionState {
            vm_hash: inter.hash(),
            block_gas_used: cumulative_gas,
            state_type: StateType::Inter,
            block: Arc::clone(&block),
            tx_index: transactions.len() as u64,
            step_index: 0,
        });

        // Jump to the committed end-of-block state instead of simulating
        // block finalization.
        let (bs, next_state) = start_block_state(backend, &block, config.reexec).await?;
        states.push(ExecutionState {
            vm_hash: bs.hash(),
            block_gas_used: U256::ZERO,
            state_type: StateType::Block,
            block: Arc::clone(&block),
            tx_index: 0,
            step_index: 0,
        });
        state = next_state;
    }

    let end_parent = backend.block_by_number(end - 1).await?;
    let end_header = backend.header_by_number(end).await?;
    states.push(ExecutionState {
        vm_hash: end_header.state_root,
        block_gas_used: U256::ZERO,
        state_type: StateType::Block,
        block: end_parent,
        tx_index: 0,
        step_index: 0,
    });
    info!(end, vm_hash = %end_header.state_root, count = states.len(), "materialized states");

    Ok(states)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{TestChain, TestTx};

    fn chain() -> TestChain {
        TestChain::builder()
            .block(vec![TestTx::transfer(), TestTx::contract_call(3)])
            .block(vec![])
            .block(vec![TestTx::contract_call(2)])
            .build()
    }

    #[tokio::test]
    async fn boundary_hashes_match_headers() {
        let chain = chain();
        let states = generate_states(&chain, 1, 3, &ProverConfig::default())
            .await
            .unwrap();

        assert!(states.len() >= 2);
        let start_header = chain.header_by_number(1).await.unwrap();
        let end_header = chain.header_by_number(3).await.unwrap();
        assert_eq!(states.first().unwrap().vm_hash, start_header.state_root);
        assert_eq!(states.last().unwrap().vm_hash, end_header.state_root);

        // Head and tail carry the respective parent as their block.
        assert_eq!(states.first().unwrap().block.header.number, 0);
        assert_eq!(states.last().unwrap().block.header.number, 2);
    }

    #[tokio::test]
    async fn sequence_shape_per_block() {
        let chain = chain();
        let states = generate_states(&chain, 1, 2, &ProverConfig::default())
            .await
            .unwrap();

        // Block 1 has a transfer (no intra states) and a 3-step call:
        // boundary, inter(0), inter(1), intra x3, inter(2), block, boundary.
        let types: Vec<StateType> = states.iter().map(|s| s.state_type).collect();
        assert_eq!(
            types,
            vec![
                StateType::Block,
                StateType::Inter,
                StateType::Inter,
                StateType::Intra,
                StateType::Intra,
                StateType::Intra,
                StateType::Inter,
                StateType::Block,
                StateType::Block,
            ]
        );

        // Intra step indices are 1-based and contiguous.
        let steps: Vec<u64> = states
            .iter()
            .filter(|s| s.state_type == StateType::Intra)
            .map(|s| s.step_index)
            .collect();
        assert_eq!(steps, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn eoa_transfer_produces_no_intra_states() {
        let chain = TestChain::builder()
            .block(vec![TestTx::transfer(), TestTx::transfer()])
            .build();
        let states = generate_states(&chain, 1, 2, &ProverConfig::default())
            .await
            .unwrap();
        assert!(states.iter().all(|s| s.state_type != StateType::Intra));
    }

    #[tokio::test]
    async fn cumulative_gas_accounting() {
        let chain = chain();
        let states = generate_states(&chain, 1, 2, &ProverConfig::default())
            .await
            .unwrap();

        // Inter-state before the first tx starts at zero.
        let first_inter = states
            .iter()
            .find(|s| s.state_type == StateType::Inter)
            .unwrap();
        assert_eq!(first_inter.block_gas_used, U256::ZERO);

        // The trailing inter-state carries the block's full gas.
        let last_inter = states
            .iter()
            .rev()
            .find(|s| s.state_type == StateType::Inter)
            .unwrap();
        let block = chain.block_by_number(1).await.unwrap();
        assert_eq!(
            last_inter.block_gas_used,
            U256::from(block.header.gas_used)
        );
        assert_eq!(last_inter.tx_index, block.body.transactions.len() as u64);

        // Intra states charge gas_limit - gas_remaining on top of the
        // cumulative counter.
        let intras: Vec<&ExecutionState> = states
            .iter()
            .filter(|s| s.state_type == StateType::Intra)
            .collect();
        for pair in intras.windows(2) {
            assert!(pair[0].block_gas_used < pair[1].block_gas_used);
        }
    }

    #[tokio::test]
    async fn determinism_across_runs() {
        let chain = chain();
        let a = generate_states(&chain, 1, 3, &ProverConfig::default())
            .await
            .unwrap();
        let b = generate_states(&chain, 1, 3, &ProverConfig::default())
            .await
            .unwrap();
        let hashes = |v: &[ExecutionState]| v.iter().map(|s| s.vm_hash).collect::<Vec<_>>();
        assert_eq!(hashes(&a), hashes(&b));
    }

    #[tokio::test]
    async fn missing_block_aborts() {
        let chain = chain();
        let err = generate_states(&chain, 1, 9, &ProverConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProofError::BadBlock(_)));
    }

    #[tokio::test]
    async fn genesis_start_is_rejected() {
        let chain = chain();
        let err = generate_states(&chain, 0, 2, &ProverConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProofError::InvalidRange { .. }));
    }
}
