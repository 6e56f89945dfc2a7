//! Step tracers injected into the execution backend.
//!
//! The backend invokes [`StepTracer::step`] after every EVM opcode with a
//! borrowed view of the interpreter. Two tracers share that seam: the
//! [`IntraStateGenerator`] records a commitment per step while the state
//! vector is materialized, and the [`OneStepProver`] replays a transaction to
//! capture the full witness of a single step.

use alloy_primitives::{B256, U256};

use crate::proof::error::ProofError;
use crate::proof::state::{bytes_commitment, stack_commitment, BlockHashTree, IntraState};

/// Borrowed view of the interpreter after one EVM step.
#[derive(Debug)]
pub struct VmStep<'a> {
    /// Call depth of the executing frame (1 for the outermost frame).
    pub depth: u64,
    /// Program counter of the executed opcode.
    pub program_counter: u64,
    /// The executed opcode.
    pub opcode: u8,
    /// Gas remaining after the step.
    pub gas_remaining: u64,
    /// Operand stack, bottom first.
    pub stack: &'a [U256],
    /// Active memory of the frame.
    pub memory: &'a [u8],
    /// Return-data buffer.
    pub return_data: &'a [u8],
    /// Commitment over the state accesses of the transaction so far,
    /// maintained by the backend's state handle.
    pub access_root: B256,
}

/// Callback capability handed to [`Backend::execute_transaction`].
///
/// [`Backend::execute_transaction`]: crate::backend::Backend::execute_transaction
pub trait StepTracer: Send {
    /// Called after every EVM step.
    fn step(&mut self, step: &VmStep<'_>);
}

/// A recorded intra-state: its commitment plus the gas remaining at the
/// step, which the materializer converts into cumulative block gas.
#[derive(Debug, Clone, Copy)]
pub struct StepRecord {
    /// The `vm_hash` of the intra-state.
    pub vm_hash: B256,
    /// Gas remaining in the transaction after the step.
    pub gas_remaining: u64,
}

/// Maintains the caller-frame hash chain across depth changes.
///
/// Entering a frame pushes a commitment to the caller's last step; leaving a
/// frame pops it. The top of the chain binds the whole caller ancestry into
/// each [`IntraState`].
#[derive(Debug, Default)]
struct FrameChain {
    frames: Vec<B256>,
    prev_depth: u64,
    prev_hash: B256,
}

impl FrameChain {
    fn observe(&mut self, depth: u64) -> B256 {
        if depth > self.prev_depth {
            self.frames.push(self.prev_hash);
        }
        while (self.frames.len() as u64) + 1 > depth.max(1) {
            self.frames.pop();
        }
        self.prev_depth = depth;
        self.frames.last().copied().unwrap_or(B256::ZERO)
    }

    fn record(&mut self, hash: B256) {
        self.prev_hash = hash;
    }
}

/// Tracer that records an [`IntraState`] commitment after every step of a
/// transaction, used while materializing the state vector.
#[derive(Debug)]
pub struct IntraStateGenerator {
    block_number: u64,
    tx_index: u64,
    block_hash_root: B256,
    chain: FrameChain,
    records: Vec<StepRecord>,
}

impl IntraStateGenerator {
    /// Creates a generator for transaction `tx_index` of block
    /// `block_number`.
    pub fn new(block_number: u64, tx_index: u64, tree: &BlockHashTree) -> Self {
        Self {
            block_number,
            tx_index,
            block_hash_root: tree.root(),
            chain: FrameChain::default(),
            records: Vec::new(),
        }
    }

    fn intra_state(&mut self, step: &VmStep<'_>) -> IntraState {
        let call_frame_hash = self.chain.observe(step.depth);
        IntraState {
            block_number: self.block_number,
            tx_index: self.tx_index,
            depth: step.depth,
            program_counter: step.program_counter,
            opcode: step.opcode,
            gas_remaining: step.gas_remaining,
            stack_hash: stack_commitment(step.stack),
            memory_size: step.memory.len() as u64,
            memory_root: bytes_commitment(step.memory),
            return_data_root: bytes_commitment(step.return_data),
            call_frame_hash,
            access_root: step.access_root,
        }
    }

    /// The recorded steps, in execution order.
    pub fn into_records(self) -> Vec<StepRecord> {
        self.records
    }
}

impl StepTracer for IntraStateGenerator {
    fn step(&mut self, step: &VmStep<'_>) {
        let state = self.intra_state(step);
        let vm_hash = state.hash();
        self.chain.record(vm_hash);
        self.records.push(StepRecord {
            vm_hash,
            gas_remaining: step.gas_remaining,
        });
    }
}

/// Owned snapshot of the interpreter at the proven step.
#[derive(Debug, Clone)]
pub struct StepWitness {
    /// The intra-state commitment at the start of the transition.
    pub pre: IntraState,
    /// Operand stack at the step.
    pub stack: Vec<U256>,
    /// Memory contents at the step.
    pub memory: Vec<u8>,
    /// Return-data buffer at the step.
    pub return_data: Vec<u8>,
}

/// Tracer that replays a transaction up to a target step and captures the
/// witness there.
///
/// `target_step` is the 1-based step index of the transition's start state.
/// After the run, [`into_witness`](OneStepProver::into_witness) yields the
/// captured snapshot together with whether the target was the transaction's
/// final step (a transaction-finalization transition rather than a plain EVM
/// step).
#[derive(Debug)]
pub struct OneStepProver {
    start_vm_hash: B256,
    target_step: u64,
    generator: IntraStateGenerator,
    counter: u64,
    witness: Option<StepWitness>,
    diverged: bool,
}

impl OneStepProver {
    /// Creates a prover targeting step `target_step` with the expected start
    /// commitment `start_vm_hash`.
    pub fn new(
        start_vm_hash: B256,
        target_step: u64,
        block_number: u64,
        tx_index: u64,
        tree: &BlockHashTree,
    ) -> Self {
        Self {
            start_vm_hash,
            target_step,
            generator: IntraStateGenerator::new(block_number, tx_index, tree),
            counter: 0,
            witness: None,
            diverged: false,
        }
    }

    /// Consumes the prover; `(witness, is_final_step)`.
    pub fn into_witness(self) -> Result<(StepWitness, bool), ProofError> {
        if self.diverged {
            return Err(ProofError::TraceError(format!(
                "replay diverged from expected state at step {}",
                self.target_step
            )));
        }
        let is_final = self.counter == self.target_step;
        match self.witness {
            Some(witness) => Ok((witness, is_final)),
            None => Err(ProofError::TraceError(format!(
                "transaction ended after {} steps, target step {}",
                self.counter, self.target_step
            ))),
        }
    }
}

impl StepTracer for OneStepProver {
    fn step(&mut self, step: &VmStep<'_>) {
        self.counter += 1;
        let state = self.generator.intra_state(step);
        let vm_hash = state.hash();
        self.generator.chain.record(vm_hash);

        if self.counter == self.target_step {
            if vm_hash != self.start_vm_hash {
                self.diverged = true;
            }
            self.witness = Some(StepWitness {
                pre: state,
                stack: step.stack.to_vec(),
                memory: step.memory.to_vec(),
                return_data: step.return_data.to_vec(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step<'a>(depth: u64, pc: u64, stack: &'a [U256]) -> VmStep<'a> {
        VmStep {
            depth,
            program_counter: pc,
            opcode: 0x01,
            gas_remaining: 100_000 - pc,
            stack,
            memory: &[],
            return_data: &[],
            access_root: B256::ZERO,
        }
    }

    #[test]
    fn generator_records_one_state_per_step() {
        let tree = BlockHashTree::new(vec![]);
        let mut gen = IntraStateGenerator::new(1, 0, &tree);
        let stack = [U256::from(1)];
        gen.step(&step(1, 0, &stack));
        gen.step(&step(1, 1, &stack));
        gen.step(&step(1, 2, &stack));
        let records = gen.into_records();
        assert_eq!(records.len(), 3);
        // Distinct pcs give distinct commitments.
        assert_ne!(records[0].vm_hash, records[1].vm_hash);
        assert_ne!(records[1].vm_hash, records[2].vm_hash);
    }

    #[test]
    fn generator_is_deterministic() {
        let tree = BlockHashTree::new(vec![B256::repeat_byte(0x07)]);
        let run = || {
            let mut gen = IntraStateGenerator::new(2, 1, &tree);
            let stack = [U256::from(9)];
            gen.step(&step(1, 0, &stack));
            gen.step(&step(2, 0, &stack));
            gen.step(&step(1, 1, &stack));
            gen.into_records()
                .into_iter()
                .map(|r| r.vm_hash)
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn frame_chain_binds_caller() {
        let tree = BlockHashTree::new(vec![]);
        let stack = [U256::from(1)];

        // Same step shape at depth 2, but reached from different callers.
        let mut a = IntraStateGenerator::new(1, 0, &tree);
        a.step(&step(1, 10, &stack));
        a.step(&step(2, 0, &stack));
        let a_records = a.into_records();

        let mut b = IntraStateGenerator::new(1, 0, &tree);
        b.step(&step(1, 20, &stack));
        b.step(&step(2, 0, &stack));
        let b_records = b.into_records();

        assert_ne!(a_records[1].vm_hash, b_records[1].vm_hash);
    }

    #[test]
    fn prover_captures_target_and_detects_final_step() {
        let tree = BlockHashTree::new(vec![]);
        let stack = [U256::from(1)];

        // First learn the canonical hashes from a generator run.
        let mut gen = IntraStateGenerator::new(1, 0, &tree);
        gen.step(&step(1, 0, &stack));
        gen.step(&step(1, 1, &stack));
        let records = gen.into_records();

        // Target the first step: a later step exists, so not final.
        let mut prover = OneStepProver::new(records[0].vm_hash, 1, 1, 0, &tree);
        prover.step(&step(1, 0, &stack));
        prover.step(&step(1, 1, &stack));
        let (witness, is_final) = prover.into_witness().unwrap();
        assert!(!is_final);
        assert_eq!(witness.pre.hash(), records[0].vm_hash);

        // Target the last step: finalization transition.
        let mut prover = OneStepProver::new(records[1].vm_hash, 2, 1, 0, &tree);
        prover.step(&step(1, 0, &stack));
        prover.step(&step(1, 1, &stack));
        let (_, is_final) = prover.into_witness().unwrap();
        assert!(is_final);
    }

    #[test]
    fn prover_flags_divergence() {
        let tree = BlockHashTree::new(vec![]);
        let stack = [U256::from(1)];
        let mut prover = OneStepProver::new(B256::repeat_byte(0xff), 1, 1, 0, &tree);
        prover.step(&step(1, 0, &stack));
        assert!(matches!(
            prover.into_witness(),
            Err(ProofError::TraceError(_))
        ));
    }

    #[test]
    fn prover_errors_when_target_past_end() {
        let tree = BlockHashTree::new(vec![]);
        let stack = [U256::from(1)];
        let mut prover = OneStepProver::new(B256::ZERO, 5, 1, 0, &tree);
        prover.step(&step(1, 0, &stack));
        assert!(matches!(
            prover.into_witness(),
            Err(ProofError::TraceError(_))
        ));
    }
}
