//! Hashable execution-state commitments.
//!
//! Every entry of the bisection domain is summarized by a 32-byte `vm_hash`.
//! The byte layouts here are part of the on-chain verifier ABI: they must
//! stay stable and identical across implementations, which is why each
//! commitment is a keccak over a fixed-width packed encoding rather than a
//! derived serialization.

use alloy_consensus::{ReceiptEnvelope, TxEnvelope};
use alloy_eips::eip2718::Encodable2718;
use alloy_primitives::{keccak256, B256, U256};
use alloy_trie::root::ordered_trie_root_with_encoder;

use crate::backend::StateHandle;
use crate::constants::BLOCKHASH_WINDOW;

/// Position of an execution state relative to block and transaction
/// boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StateType {
    /// State at a block boundary.
    Block = 0,
    /// State between transactions within a block.
    Inter = 1,
    /// State between two EVM steps within a transaction.
    Intra = 2,
}

/// Merkle summary of the block hashes visible to the EVM via `BLOCKHASH`.
///
/// The window holds up to 256 ancestor hashes, newest last; shorter histories
/// (near genesis) are zero-padded at the front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHashTree {
    leaves: Vec<B256>,
}

impl BlockHashTree {
    /// Builds the tree from ancestor hashes ordered oldest first.
    pub fn new(mut hashes: Vec<B256>) -> Self {
        if hashes.len() > BLOCKHASH_WINDOW {
            hashes.drain(..hashes.len() - BLOCKHASH_WINDOW);
        }
        let mut leaves = vec![B256::ZERO; BLOCKHASH_WINDOW - hashes.len()];
        leaves.extend(hashes);
        Self { leaves }
    }

    /// Root of the binary keccak tree over the 256 leaves.
    pub fn root(&self) -> B256 {
        let mut level = self.leaves.clone();
        while level.len() > 1 {
            level = level
                .chunks(2)
                .map(|pair| {
                    let mut buf = [0u8; 64];
                    buf[..32].copy_from_slice(pair[0].as_slice());
                    buf[32..].copy_from_slice(pair[1].as_slice());
                    keccak256(buf)
                })
                .collect();
        }
        level[0]
    }
}

/// Commitment at a block boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockState {
    /// Number of the completed block.
    pub block_number: u64,
    /// Global state root at the end of the block.
    pub state_root: B256,
    /// Root of the block-hash window at this block.
    pub block_hash_root: B256,
}

impl BlockState {
    /// Captures the block-boundary commitment from a state handle.
    pub fn from_state(block_number: u64, state: &dyn StateHandle, tree: &BlockHashTree) -> Self {
        Self {
            block_number,
            state_root: state.state_root(),
            block_hash_root: tree.root(),
        }
    }

    /// Fixed-width packed encoding, part of the verifier ABI.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 32 + 32);
        buf.extend_from_slice(&self.block_number.to_be_bytes());
        buf.extend_from_slice(self.state_root.as_slice());
        buf.extend_from_slice(self.block_hash_root.as_slice());
        buf
    }

    /// The `vm_hash` of this state.
    pub fn hash(&self) -> B256 {
        keccak256(self.encode())
    }
}

/// Commitment between transactions within a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterState {
    /// Containing block number.
    pub block_number: u64,
    /// Index of the next transaction (== tx count after the last one).
    pub tx_index: u64,
    /// Global state root after the preceding transactions.
    pub global_state_root: B256,
    /// Gas consumed by the block so far.
    pub block_gas_used: U256,
    /// Transactions trie root of the block.
    pub tx_root: B256,
    /// Receipts trie root of the block.
    pub receipt_root: B256,
    /// Root of the block-hash window.
    pub block_hash_root: B256,
}

impl InterState {
    /// Captures the between-transactions commitment from the live state.
    pub fn from_captured(
        block_number: u64,
        tx_index: u64,
        state: &dyn StateHandle,
        block_gas_used: U256,
        transactions: &[TxEnvelope],
        receipts: &[ReceiptEnvelope],
        tree: &BlockHashTree,
    ) -> Self {
        Self {
            block_number,
            tx_index,
            global_state_root: state.state_root(),
            block_gas_used,
            tx_root: transactions_root(transactions),
            receipt_root: receipts_root(receipts),
            block_hash_root: tree.root(),
        }
    }

    /// Fixed-width packed encoding, part of the verifier ABI.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 8 + 32 * 5);
        buf.extend_from_slice(&self.block_number.to_be_bytes());
        buf.extend_from_slice(&self.tx_index.to_be_bytes());
        buf.extend_from_slice(self.global_state_root.as_slice());
        buf.extend_from_slice(&self.block_gas_used.to_be_bytes::<32>());
        buf.extend_from_slice(self.tx_root.as_slice());
        buf.extend_from_slice(self.receipt_root.as_slice());
        buf.extend_from_slice(self.block_hash_root.as_slice());
        buf
    }

    /// The `vm_hash` of this state.
    pub fn hash(&self) -> B256 {
        keccak256(self.encode())
    }
}

/// Commitment between two EVM steps within a transaction.
///
/// Binds everything a one-step verifier needs to pin the interpreter: the
/// machine registers, the operand stack, memory, return data, the caller
/// frame chain, and the state accesses of the transaction so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntraState {
    /// Containing block number.
    pub block_number: u64,
    /// Containing transaction index.
    pub tx_index: u64,
    /// Call depth of the interpreter frame.
    pub depth: u64,
    /// Program counter before the next step.
    pub program_counter: u64,
    /// Opcode executed at this step.
    pub opcode: u8,
    /// Gas remaining in the transaction.
    pub gas_remaining: u64,
    /// Commitment over the operand stack.
    pub stack_hash: B256,
    /// Active memory size in bytes.
    pub memory_size: u64,
    /// Commitment over memory contents.
    pub memory_root: B256,
    /// Commitment over the current return-data buffer.
    pub return_data_root: B256,
    /// Hash chain over the caller frames.
    pub call_frame_hash: B256,
    /// Commitment over the state-access deltas of the transaction.
    pub access_root: B256,
}

impl IntraState {
    /// Fixed-width packed encoding, part of the verifier ABI.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 * 5 + 1 + 32 * 5);
        buf.extend_from_slice(&self.block_number.to_be_bytes());
        buf.extend_from_slice(&self.tx_index.to_be_bytes());
        buf.extend_from_slice(&self.depth.to_be_bytes());
        buf.extend_from_slice(&self.program_counter.to_be_bytes());
        buf.push(self.opcode);
        buf.extend_from_slice(&self.gas_remaining.to_be_bytes());
        buf.extend_from_slice(self.stack_hash.as_slice());
        buf.extend_from_slice(&self.memory_size.to_be_bytes());
        buf.extend_from_slice(self.memory_root.as_slice());
        buf.extend_from_slice(self.return_data_root.as_slice());
        buf.extend_from_slice(self.call_frame_hash.as_slice());
        buf.extend_from_slice(self.access_root.as_slice());
        buf
    }

    /// The `vm_hash` of this state.
    pub fn hash(&self) -> B256 {
        keccak256(self.encode())
    }
}

/// Transactions trie root over EIP-2718 envelope encodings.
pub fn transactions_root(transactions: &[TxEnvelope]) -> B256 {
    ordered_trie_root_with_encoder(transactions, |tx, buf| tx.encode_2718(buf))
}

/// Receipts trie root over EIP-2718 envelope encodings.
pub fn receipts_root(receipts: &[ReceiptEnvelope]) -> B256 {
    ordered_trie_root_with_encoder(receipts, |receipt, buf| receipt.encode_2718(buf))
}

/// Commitment over an operand stack, bottom first.
pub fn stack_commitment(stack: &[U256]) -> B256 {
    let mut buf = Vec::with_capacity(stack.len() * 32);
    for word in stack {
        buf.extend_from_slice(&word.to_be_bytes::<32>());
    }
    keccak256(buf)
}

/// Commitment over a raw byte region (memory, return data).
pub fn bytes_commitment(bytes: &[u8]) -> B256 {
    keccak256(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FixedState;

    #[test]
    fn block_state_encoding_layout() {
        let bs = BlockState {
            block_number: 7,
            state_root: B256::repeat_byte(0x11),
            block_hash_root: B256::repeat_byte(0x22),
        };
        let enc = bs.encode();
        assert_eq!(enc.len(), 72);
        assert_eq!(&enc[..8], &7u64.to_be_bytes());
        assert_eq!(&enc[8..40], B256::repeat_byte(0x11).as_slice());
    }

    #[test]
    fn inter_state_hash_binds_every_field() {
        let base = InterState {
            block_number: 3,
            tx_index: 1,
            global_state_root: B256::repeat_byte(0x01),
            block_gas_used: U256::from(21_000),
            tx_root: B256::repeat_byte(0x02),
            receipt_root: B256::repeat_byte(0x03),
            block_hash_root: B256::repeat_byte(0x04),
        };
        let h = base.hash();

        let mut changed = base.clone();
        changed.block_gas_used = U256::from(21_001);
        assert_ne!(h, changed.hash());

        let mut changed = base.clone();
        changed.tx_index = 2;
        assert_ne!(h, changed.hash());

        assert_eq!(h, base.clone().hash());
    }

    #[test]
    fn intra_state_encoding_is_fixed_width() {
        let intra = IntraState {
            block_number: 1,
            tx_index: 0,
            depth: 1,
            program_counter: 42,
            opcode: 0x01,
            gas_remaining: 90_000,
            stack_hash: stack_commitment(&[U256::from(1), U256::from(2)]),
            memory_size: 64,
            memory_root: bytes_commitment(&[0u8; 64]),
            return_data_root: bytes_commitment(&[]),
            call_frame_hash: B256::ZERO,
            access_root: B256::repeat_byte(0x05),
        };
        assert_eq!(intra.encode().len(), 8 * 5 + 1 + 32 * 5);
    }

    #[test]
    fn block_hash_tree_pads_short_histories() {
        let empty = BlockHashTree::new(vec![]);
        let zeroed = BlockHashTree::new(vec![B256::ZERO; 256]);
        assert_eq!(empty.root(), zeroed.root());

        let one = BlockHashTree::new(vec![B256::repeat_byte(0xaa)]);
        assert_ne!(one.root(), empty.root());
    }

    #[test]
    fn block_hash_tree_keeps_newest_256() {
        let mut hashes: Vec<B256> = (0..300u64)
            .map(|i| keccak256(i.to_be_bytes()))
            .collect();
        let tree = BlockHashTree::new(hashes.clone());
        // Equivalent to a window holding only the newest 256 entries.
        let newest = hashes.split_off(300 - 256);
        assert_eq!(tree.root(), BlockHashTree::new(newest).root());
    }

    #[test]
    fn block_state_from_state_captures_root() {
        let state = FixedState::new(B256::repeat_byte(0x42));
        let tree = BlockHashTree::new(vec![]);
        let bs = BlockState::from_state(5, &state, &tree);
        assert_eq!(bs.state_root, B256::repeat_byte(0x42));
        assert_eq!(bs.block_number, 5);
    }

    #[test]
    fn stack_commitment_is_order_sensitive() {
        let a = stack_commitment(&[U256::from(1), U256::from(2)]);
        let b = stack_commitment(&[U256::from(2), U256::from(1)]);
        assert_ne!(a, b);
    }
}
