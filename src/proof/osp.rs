//! One-step proof generation.
//!
//! When bisection collapses to a single transition, the validator submits a
//! proof blob the on-chain verifier can check in one call. There are six
//! transition shapes:
//!
//! 1. `BlockState -> InterState`: block initiation
//! 2. `InterState -> IntraState`: transaction initiation (call or create)
//! 3. `InterState -> InterState`: EOA transfer transaction
//! 4. `IntraState -> IntraState`: one EVM step (requires tracing)
//! 5. `IntraState -> InterState`: transaction finalization (requires tracing)
//! 6. `InterState -> BlockState`: block finalization
//!
//! The blob layouts are part of the verifier ABI; byte compatibility is
//! pinned by the tests at the bottom of this module.

use alloy_consensus::{ReceiptEnvelope, Transaction, TxEnvelope};
use alloy_eips::eip2718::Encodable2718;
use alloy_primitives::{Address, Bytes, B256, U256};

use crate::backend::{block_hash, Backend};
use crate::proof::error::ProofError;
use crate::proof::state::{BlockHashTree, BlockState, InterState, StateType};
use crate::proof::states::{ExecutionState, ProverConfig};
use crate::proof::tracer::{OneStepProver, StepWitness};

/// Discriminant of the on-chain verifier a proof is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VerifierType {
    /// `BlockState -> InterState`.
    BlockInitiation = 0,
    /// `InterState -> BlockState`.
    BlockFinalization = 1,
    /// `InterState -> IntraState`, contract call or creation.
    TransactionInitiation = 2,
    /// `InterState -> InterState`, plain value transfer.
    EoaTransfer = 3,
    /// `IntraState -> IntraState`.
    OneStepEvm = 4,
    /// `IntraState -> InterState`.
    TransactionFinalization = 5,
}

/// A verifier-ready proof blob.
#[derive(Debug, Clone)]
pub struct OneStepProof {
    /// Which verifier contract variant consumes the blob.
    pub verifier: VerifierType,
    /// The encoded proof.
    pub proof: Bytes,
}

impl OneStepProof {
    /// The encoded blob submitted on-chain.
    pub fn encode(&self) -> Bytes {
        self.proof.clone()
    }
}

fn length_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
    buf.extend_from_slice(bytes);
}

/// Proof for a block-initiation transition, from the boundary snapshot.
pub fn block_initiation_proof(bs: &BlockState) -> OneStepProof {
    OneStepProof {
        verifier: VerifierType::BlockInitiation,
        proof: bs.encode().into(),
    }
}

/// Proof for a block-finalization transition, from the trailing inter-state.
pub fn block_finalization_proof(its: &InterState) -> OneStepProof {
    OneStepProof {
        verifier: VerifierType::BlockFinalization,
        proof: its.encode().into(),
    }
}

/// Proof for a transaction-initiation transition (or its EOA-transfer
/// variant): the pre-transaction inter-state plus the raw transaction.
pub fn transaction_initiation_proof(
    its: &InterState,
    tx: &TxEnvelope,
    is_eoa_transfer: bool,
) -> OneStepProof {
    let mut buf = its.encode();
    let mut raw = Vec::new();
    tx.encode_2718(&mut raw);
    length_prefixed(&mut buf, &raw);
    OneStepProof {
        verifier: if is_eoa_transfer {
            VerifierType::EoaTransfer
        } else {
            VerifierType::TransactionInitiation
        },
        proof: buf.into(),
    }
}

fn witness_blob(witness: &StepWitness) -> Vec<u8> {
    let mut buf = witness.pre.encode();
    buf.extend_from_slice(&(witness.stack.len() as u64).to_be_bytes());
    for word in &witness.stack {
        buf.extend_from_slice(&word.to_be_bytes::<32>());
    }
    length_prefixed(&mut buf, &witness.memory);
    length_prefixed(&mut buf, &witness.return_data);
    buf
}

/// Proof for a single EVM step.
pub fn one_step_evm_proof(witness: &StepWitness) -> OneStepProof {
    OneStepProof {
        verifier: VerifierType::OneStepEvm,
        proof: witness_blob(witness).into(),
    }
}

/// Proof for a transaction-finalization transition: the last-step witness
/// plus the transaction's receipt.
pub fn transaction_finalization_proof(
    witness: &StepWitness,
    receipt: &ReceiptEnvelope,
) -> OneStepProof {
    let mut buf = witness_blob(witness);
    let mut raw = Vec::new();
    receipt.encode_2718(&mut raw);
    length_prefixed(&mut buf, &raw);
    OneStepProof {
        verifier: VerifierType::TransactionFinalization,
        proof: buf.into(),
    }
}

/// Transaction fields of a [`VerificationContext`], zeroed when the proven
/// state has no containing transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxContext {
    /// Transaction nonce.
    pub nonce: U256,
    /// Gas price; the fee cap for dynamic-fee transactions.
    pub gas_price: U256,
    /// Gas limit.
    pub gas: U256,
    /// Call target (zero for creations).
    pub to: Address,
    /// Transferred value.
    pub value: U256,
    /// Calldata.
    pub data: Bytes,
    /// Signature v, zero for queue-origin transactions.
    pub v: U256,
    /// Signature r, zero for queue-origin transactions.
    pub r: U256,
    /// Signature s, zero for queue-origin transactions.
    pub s: U256,
}

/// Per-proof preamble submitted alongside every one-step proof.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationContext {
    /// Block coinbase.
    pub coinbase: Address,
    /// L1-origin timestamp of the transaction, zero when absent.
    pub timestamp: U256,
    /// L2 block number.
    pub block_number: U256,
    /// Recovered transaction origin, zero when unrecoverable.
    pub origin: Address,
    /// The transaction, zeroed when the state sits on a block boundary.
    pub transaction: TxContext,
    /// Always zero.
    pub input_root: B256,
    /// Hash of the transaction, zero when absent.
    pub tx_hash: B256,
}

impl VerificationContext {
    /// Builds the preamble for `state`.
    ///
    /// The timestamp is the transaction's L1-origin time supplied by the
    /// backend, not the L2 block time. Transactions whose signature cannot
    /// be recovered (queue-origin transactions carry a zeroed signature) get
    /// a zero origin and zeroed signature fields. States without a
    /// containing transaction get a fully zeroed transaction context and a
    /// zero timestamp.
    pub async fn build<B: Backend + ?Sized>(
        backend: &B,
        state: &ExecutionState,
    ) -> Result<Self, ProofError> {
        let header = &state.block.header;
        let tx_index = state.tx_index as usize;
        let tx = state.block.body.transactions.get(tx_index);

        let (transaction, origin, tx_hash, timestamp) = match tx {
            Some(tx) => {
                let l1_time = backend.l1_timestamp(&state.block, tx_index).await?;
                let signature = tx.signature();
                let queue_origin =
                    signature.r().is_zero() && signature.s().is_zero();
                let (v, r, s, origin) = if queue_origin {
                    (U256::ZERO, U256::ZERO, U256::ZERO, Address::ZERO)
                } else {
                    use alloy_consensus::transaction::SignerRecoverable;
                    (
                        U256::from(u8::from(signature.v())),
                        signature.r(),
                        signature.s(),
                        tx.recover_signer().unwrap_or(Address::ZERO),
                    )
                };
                let ctx = TxContext {
                    nonce: U256::from(tx.nonce()),
                    // gas_price() is None for fee-market transactions; the
                    // context carries their fee cap.
                    gas_price: U256::from(
                        tx.gas_price().unwrap_or_else(|| tx.max_fee_per_gas()),
                    ),
                    gas: U256::from(tx.gas_limit()),
                    to: tx.to().unwrap_or(Address::ZERO),
                    value: tx.value(),
                    data: tx.input().clone(),
                    v,
                    r,
                    s,
                };
                (ctx, origin, *tx.tx_hash(), U256::from(l1_time))
            }
            None => (TxContext::default(), Address::ZERO, B256::ZERO, U256::ZERO),
        };

        Ok(Self {
            coinbase: header.beneficiary,
            timestamp,
            block_number: U256::from(header.number),
            origin,
            transaction,
            input_root: B256::ZERO,
            tx_hash,
        })
    }
}

/// Generates the one-step proof for the transition starting at `state`.
pub async fn generate_proof<B: Backend + ?Sized>(
    backend: &B,
    state: &ExecutionState,
    config: &ProverConfig,
) -> Result<OneStepProof, ProofError> {
    let transactions = &state.block.body.transactions;
    if state.tx_index as usize > transactions.len() {
        return Err(ProofError::BadStartState("transaction index out of range"));
    }

    let number = state.block.header.number;
    let hash = block_hash(&state.block);
    let reexec = config.reexec;

    // Block boundaries never need per-step tracing.
    let at_block_boundary = state.state_type == StateType::Block
        || (state.state_type == StateType::Inter
            && state.tx_index as usize == transactions.len());
    if at_block_boundary {
        let statedb = backend.state_at_block(&state.block, reexec).await?;
        let tree = BlockHashTree::new(backend.recent_block_hashes(number).await?);
        if state.state_type == StateType::Block {
            let bs = BlockState::from_state(number, statedb.as_ref(), &tree);
            return Ok(block_initiation_proof(&bs));
        }
        let receipts = backend.receipts(hash).await?;
        let its = InterState::from_captured(
            number,
            state.tx_index,
            statedb.as_ref(),
            state.block_gas_used,
            transactions,
            &receipts,
            &tree,
        );
        return Ok(block_finalization_proof(&its));
    }

    let tx_index = state.tx_index as usize;
    let mut statedb = backend
        .state_at_transaction(&state.block, tx_index, reexec)
        .await?;
    let tree = BlockHashTree::new(backend.recent_block_hashes(number).await?);
    let receipts = backend.receipts(hash).await?;
    let tx = &transactions[tx_index];

    if state.state_type == StateType::Inter {
        let its = InterState::from_captured(
            number,
            state.tx_index,
            statedb.as_ref(),
            state.block_gas_used,
            transactions,
            &receipts,
            &tree,
        );
        let is_eoa_transfer = tx.input().is_empty()
            && tx
                .to()
                .is_some_and(|to| !statedb.has_code(to));
        return Ok(transaction_initiation_proof(&its, tx, is_eoa_transfer));
    }

    // Intra-state: replay the transaction up to the target step.
    let mut prover = OneStepProver::new(
        state.vm_hash,
        state.step_index,
        number,
        state.tx_index,
        &tree,
    );
    statedb.prepare(*tx.tx_hash(), hash, tx_index);
    backend
        .execute_transaction(statedb.as_mut(), &state.block, tx_index, &mut prover)
        .await?;
    let (witness, is_final_step) = prover.into_witness()?;

    if is_final_step {
        let receipt = receipts
            .get(tx_index)
            .ok_or(ProofError::BadStartState("missing receipt"))?;
        Ok(transaction_finalization_proof(&witness, receipt))
    } else {
        Ok(one_step_evm_proof(&witness))
    }
}
