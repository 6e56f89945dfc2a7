//! Shared test utilities: a deterministic scripted chain implementing
//! [`Backend`], an in-memory key-value store, and recording mocks for the
//! contract and L1 client traits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_consensus::{
    Block, BlockBody, Header, Receipt, ReceiptEnvelope, ReceiptWithBloom, Signed, TxEip1559,
    TxEnvelope,
};
use alloy_eips::eip2930::AccessList;
use alloy_primitives::{keccak256, Address, Bloom, Bytes, Signature, TxKind, B256, U256};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::backend::{
    Backend, ChainConfig, KeyValueStore, KvError, L2Block, StateHandle, TxExecution,
};
use crate::contracts::{
    AssertionChallengedEvent, AssertionCreatedEvent, AssertionState, BisectedEvent,
    ChallengeClient, ChallengeCompletedEvent, ChallengeContextState, ChallengeManager,
    ContractError, RollupClient, StakerStatus, Zombie,
};
use crate::proof::{ExecutionState, ProofError, StateType, StepTracer, VmStep};
use crate::rpc::{L1Client, L1Head, RpcResult};

/// Address that carries contract code on the test chain.
pub(crate) const CONTRACT_ADDR: Address = Address::repeat_byte(0xc0);
/// Plain account address used as the transfer target.
pub(crate) const EOA_ADDR: Address = Address::repeat_byte(0xee);

const TEST_GAS_LIMIT: u64 = 1_000_000;
const GAS_PER_STEP: u64 = 5_000;

/// Polls `cond` until it holds, panicking after two seconds.
pub(crate) async fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// Scripted chain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum TestTxKind {
    Transfer,
    QueueTransfer,
    ContractCall { steps: u64 },
}

/// One scripted transaction of a test block.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TestTx {
    kind: TestTxKind,
}

impl TestTx {
    /// A plain EOA value transfer (no interpreter steps).
    pub(crate) fn transfer() -> Self {
        Self {
            kind: TestTxKind::Transfer,
        }
    }

    /// A transfer carrying a zeroed signature, like a queue-origin
    /// transaction.
    pub(crate) fn queue_transfer() -> Self {
        Self {
            kind: TestTxKind::QueueTransfer,
        }
    }

    /// A contract call traced as `steps` interpreter steps.
    pub(crate) fn contract_call(steps: u64) -> Self {
        Self {
            kind: TestTxKind::ContractCall { steps },
        }
    }

    fn gas_used(&self) -> u64 {
        match self.kind {
            TestTxKind::Transfer | TestTxKind::QueueTransfer => 21_000,
            TestTxKind::ContractCall { .. } => 50_000,
        }
    }

    fn envelope(&self, block_number: u64, tx_index: usize) -> TxEnvelope {
        let (to, input) = match self.kind {
            TestTxKind::Transfer | TestTxKind::QueueTransfer => (EOA_ADDR, Bytes::new()),
            TestTxKind::ContractCall { .. } => {
                (CONTRACT_ADDR, Bytes::from(vec![0xaa, 0xbb, 0xcc, 0xdd]))
            }
        };
        let tx = TxEip1559 {
            chain_id: 1,
            nonce: tx_index as u64,
            gas_limit: TEST_GAS_LIMIT,
            max_fee_per_gas: 1_000_000_000,
            max_priority_fee_per_gas: 0,
            to: TxKind::Call(to),
            value: U256::from(1),
            access_list: AccessList::default(),
            input,
        };
        let signature = match self.kind {
            TestTxKind::QueueTransfer => Signature::new(U256::ZERO, U256::ZERO, false),
            _ => Signature::new(U256::from(1), U256::from(2), false),
        };
        let mut seed = [0u8; 16];
        seed[..8].copy_from_slice(&block_number.to_be_bytes());
        seed[8..].copy_from_slice(&(tx_index as u64).to_be_bytes());
        TxEnvelope::Eip1559(Signed::new_unchecked(tx, signature, keccak256(seed)))
    }
}

/// Builder for a deterministic scripted chain.
#[derive(Debug, Default)]
pub(crate) struct TestChainBuilder {
    blocks: Vec<Vec<TestTx>>,
}

impl TestChainBuilder {
    /// Appends a block with the given transactions.
    pub(crate) fn block(mut self, txs: Vec<TestTx>) -> Self {
        self.blocks.push(txs);
        self
    }

    pub(crate) fn build(self) -> TestChain {
        let mut roots = vec![keccak256(b"genesis")];
        let mut blocks: Vec<Arc<L2Block>> = Vec::new();
        let mut receipts = HashMap::new();
        let mut parent_hash = B256::ZERO;

        // Genesis block 0 with no transactions.
        let specs_per_block: Vec<Vec<TestTx>> = self.blocks;
        let mut all_blocks = vec![Vec::new()];
        all_blocks.extend(specs_per_block.iter().cloned());

        for (number, specs) in all_blocks.iter().enumerate() {
            let number = number as u64;
            let transactions: Vec<TxEnvelope> = specs
                .iter()
                .enumerate()
                .map(|(i, spec)| spec.envelope(number, i))
                .collect();

            // Fold the transactions into the evolving state root.
            let mut root = *roots.last().expect("genesis root");
            if number > 0 {
                for tx in &transactions {
                    root = fold_root(root, *tx.tx_hash());
                }
                roots.push(root);
            }

            let gas_used: u64 = specs.iter().map(TestTx::gas_used).sum();
            let header = Header {
                parent_hash,
                number,
                state_root: root,
                gas_used,
                gas_limit: 30_000_000,
                timestamp: 1_700_000_000 + number * 2,
                beneficiary: Address::repeat_byte(0xcb),
                ..Default::default()
            };

            let mut cumulative = 0u64;
            let block_receipts: Vec<ReceiptEnvelope> = specs
                .iter()
                .map(|spec| {
                    cumulative += spec.gas_used();
                    ReceiptEnvelope::Eip1559(ReceiptWithBloom {
                        receipt: Receipt {
                            status: true.into(),
                            cumulative_gas_used: cumulative,
                            logs: vec![],
                        },
                        logs_bloom: Bloom::ZERO,
                    })
                })
                .collect();

            let block = Arc::new(Block {
                header,
                body: BlockBody {
                    transactions,
                    ommers: vec![],
                    withdrawals: None,
                },
            });
            parent_hash = block.header.hash_slow();
            receipts.insert(parent_hash, block_receipts);
            blocks.push(block);
        }

        TestChain {
            inner: Arc::new(TestChainInner {
                blocks,
                receipts,
                roots,
                specs: all_blocks,
                db: Arc::new(MemoryKv::default()),
            }),
        }
    }
}

fn fold_root(root: B256, tx_hash: B256) -> B256 {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(root.as_slice());
    buf[32..].copy_from_slice(tx_hash.as_slice());
    keccak256(buf)
}

fn fold_access(access: B256, step: u64) -> B256 {
    let mut buf = [0u8; 40];
    buf[..32].copy_from_slice(access.as_slice());
    buf[32..].copy_from_slice(&step.to_be_bytes());
    keccak256(buf)
}

#[derive(Debug)]
struct TestChainInner {
    blocks: Vec<Arc<L2Block>>,
    receipts: HashMap<B256, Vec<ReceiptEnvelope>>,
    /// State root after each block, genesis first.
    roots: Vec<B256>,
    specs: Vec<Vec<TestTx>>,
    db: Arc<MemoryKv>,
}

/// A deterministic in-memory chain implementing [`Backend`].
#[derive(Debug, Clone)]
pub(crate) struct TestChain {
    inner: Arc<TestChainInner>,
}

impl TestChain {
    pub(crate) fn builder() -> TestChainBuilder {
        TestChainBuilder::default()
    }

    /// The canonical state root at block height `number`.
    pub(crate) fn state_root_at(&self, number: u64) -> B256 {
        self.inner.roots[number as usize]
    }
}

/// Scripted state handle: a root and an access commitment evolved by the
/// same folds the chain builder used.
#[derive(Debug)]
pub(crate) struct TestState {
    root: B256,
    access: B256,
}

impl StateHandle for TestState {
    fn state_root(&self) -> B256 {
        self.root
    }

    fn access_root(&self) -> B256 {
        self.access
    }

    fn prepare(&mut self, tx_hash: B256, block_hash: B256, tx_index: usize) {
        let mut buf = [0u8; 72];
        buf[..32].copy_from_slice(tx_hash.as_slice());
        buf[32..64].copy_from_slice(block_hash.as_slice());
        buf[64..].copy_from_slice(&(tx_index as u64).to_be_bytes());
        self.access = keccak256(buf);
    }

    fn has_code(&self, address: Address) -> bool {
        address == CONTRACT_ADDR
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// State handle pinned to a constant root, for commitment tests.
#[derive(Debug)]
pub(crate) struct FixedState {
    root: B256,
}

impl FixedState {
    pub(crate) fn new(root: B256) -> Self {
        Self { root }
    }
}

impl StateHandle for FixedState {
    fn state_root(&self) -> B256 {
        self.root
    }
    fn access_root(&self) -> B256 {
        B256::ZERO
    }
    fn prepare(&mut self, _: B256, _: B256, _: usize) {}
    fn has_code(&self, _: Address) -> bool {
        false
    }
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[async_trait]
impl Backend for TestChain {
    async fn block_by_number(&self, number: u64) -> Result<Arc<L2Block>, ProofError> {
        self.inner
            .blocks
            .get(number as usize)
            .cloned()
            .ok_or(ProofError::BadBlock(number))
    }

    async fn header_by_number(&self, number: u64) -> Result<Header, ProofError> {
        Ok(self.block_by_number(number).await?.header.clone())
    }

    async fn receipts(&self, block_hash: B256) -> Result<Vec<ReceiptEnvelope>, ProofError> {
        Ok(self
            .inner
            .receipts
            .get(&block_hash)
            .cloned()
            .unwrap_or_default())
    }

    async fn recent_block_hashes(&self, number: u64) -> Result<Vec<B256>, ProofError> {
        let number = number as usize;
        if number > self.inner.blocks.len() {
            return Err(ProofError::BadBlock(number as u64));
        }
        let from = number.saturating_sub(256);
        Ok(self.inner.blocks[from..number]
            .iter()
            .map(|b| b.header.hash_slow())
            .collect())
    }

    async fn l1_timestamp(&self, block: &L2Block, tx_index: usize) -> Result<u64, ProofError> {
        // Scripted enqueue times: one L1 slot per block, offset per tx,
        // deliberately distinct from the L2 header timestamps.
        Ok(1_699_000_000 + block.header.number * 12 + tx_index as u64)
    }

    async fn state_at_block(
        &self,
        block: &L2Block,
        _reexec: u64,
    ) -> Result<Box<dyn StateHandle>, ProofError> {
        let number = block.header.number as usize;
        let root = *self
            .inner
            .roots
            .get(number)
            .ok_or(ProofError::BadBlock(number as u64))?;
        Ok(Box::new(TestState {
            root,
            access: B256::ZERO,
        }))
    }

    async fn state_at_transaction(
        &self,
        block: &L2Block,
        tx_index: usize,
        _reexec: u64,
    ) -> Result<Box<dyn StateHandle>, ProofError> {
        let number = block.header.number as usize;
        if number == 0 {
            return Err(ProofError::BadBlock(0));
        }
        let mut root = self.inner.roots[number - 1];
        for tx in &block.body.transactions[..tx_index] {
            root = fold_root(root, *tx.tx_hash());
        }
        Ok(Box::new(TestState {
            root,
            access: B256::ZERO,
        }))
    }

    async fn execute_transaction(
        &self,
        state: &mut dyn StateHandle,
        block: &L2Block,
        tx_index: usize,
        tracer: &mut dyn StepTracer,
    ) -> Result<TxExecution, ProofError> {
        let number = block.header.number as usize;
        let spec = self
            .inner
            .specs
            .get(number)
            .and_then(|txs| txs.get(tx_index))
            .ok_or(ProofError::BadBlock(number as u64))?;
        let tx = &block.body.transactions[tx_index];
        let state = state
            .as_any_mut()
            .downcast_mut::<TestState>()
            .expect("test state handle");

        if let TestTxKind::ContractCall { steps } = spec.kind {
            for step in 1..=steps {
                state.access = fold_access(state.access, step);
                let stack = [U256::from(step)];
                let memory = vec![0u8; 32 * step as usize];
                tracer.step(&VmStep {
                    depth: 1,
                    program_counter: step,
                    opcode: 0x60,
                    gas_remaining: TEST_GAS_LIMIT - step * GAS_PER_STEP,
                    stack: &stack,
                    memory: &memory,
                    return_data: &[],
                    access_root: state.access,
                });
            }
        }

        state.root = fold_root(state.root, *tx.tx_hash());
        Ok(TxExecution {
            gas_used: spec.gas_used(),
        })
    }

    fn chain_config(&self) -> ChainConfig {
        ChainConfig { chain_id: 1 }
    }

    fn chain_db(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.inner.db) as Arc<dyn KeyValueStore>
    }
}

// ---------------------------------------------------------------------------
// In-memory key-value store
// ---------------------------------------------------------------------------

/// Mutex-guarded map implementing [`KeyValueStore`].
#[derive(Debug, Default)]
pub(crate) struct MemoryKv {
    map: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl KeyValueStore for MemoryKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
        Ok(self.map.lock().expect("kv lock").get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KvError> {
        self.map
            .lock()
            .expect("kv lock")
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), KvError> {
        self.map.lock().expect("kv lock").remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixture states for responder tests
// ---------------------------------------------------------------------------

/// A vector of `len` inter-states with distinct commitments.
pub(crate) fn fixture_states(len: usize) -> Vec<ExecutionState> {
    let block = Arc::new(Block {
        header: Header::default(),
        body: BlockBody {
            transactions: Vec::<TxEnvelope>::new(),
            ommers: vec![],
            withdrawals: None,
        },
    });
    (0..len)
        .map(|i| ExecutionState {
            vm_hash: keccak256((i as u64).to_be_bytes()),
            block_gas_used: U256::ZERO,
            state_type: StateType::Inter,
            block: Arc::clone(&block),
            tx_index: 0,
            step_index: 0,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Mock rollup client
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct MockRollupInner {
    staker: StakerStatus,
    assertions: HashMap<u64, AssertionState>,
    zombie: Zombie,
    challenge_completed: bool,
    advanced: Vec<u64>,
    created: Vec<(B256, U256)>,
    challenged: Vec<([Address; 2], [U256; 2])>,
    created_sinks: Vec<mpsc::Sender<AssertionCreatedEvent>>,
    challenged_sinks: Vec<mpsc::Sender<AssertionChallengedEvent>>,
}

/// Recording mock of [`RollupClient`].
#[derive(Debug)]
pub(crate) struct MockRollup {
    inner: Mutex<MockRollupInner>,
}

impl Default for MockRollup {
    fn default() -> Self {
        Self {
            inner: Mutex::new(MockRollupInner {
                staker: StakerStatus {
                    is_staked: true,
                    amount_staked: U256::from(1),
                    assertion_id: U256::ZERO,
                    current_challenge: Address::ZERO,
                },
                assertions: HashMap::new(),
                zombie: Zombie {
                    staker_address: Address::ZERO,
                    last_assertion_id: U256::ZERO,
                },
                challenge_completed: false,
                advanced: Vec::new(),
                created: Vec::new(),
                challenged: Vec::new(),
                created_sinks: Vec::new(),
                challenged_sinks: Vec::new(),
            }),
        }
    }
}

impl MockRollup {
    fn lock(&self) -> std::sync::MutexGuard<'_, MockRollupInner> {
        self.inner.lock().expect("mock rollup lock")
    }

    pub(crate) fn put_assertion(&self, id: u64, state_hash: B256, inbox_size: u64, parent: u64) {
        self.lock().assertions.insert(
            id,
            AssertionState {
                state_hash,
                inbox_size: U256::from(inbox_size),
                parent: U256::from(parent),
            },
        );
    }

    pub(crate) fn set_staker(&self, staker: StakerStatus) {
        self.lock().staker = staker;
    }

    pub(crate) fn set_staked_assertion(&self, id: u64) {
        self.lock().staker.assertion_id = U256::from(id);
    }

    pub(crate) fn set_zombie(&self, staker_address: Address) {
        self.lock().zombie.staker_address = staker_address;
    }

    pub(crate) fn set_challenge_completed(&self, completed: bool) {
        self.lock().challenge_completed = completed;
    }

    pub(crate) fn advanced(&self) -> Vec<u64> {
        self.lock().advanced.clone()
    }

    pub(crate) fn created_assertions(&self) -> Vec<(B256, U256)> {
        self.lock().created.clone()
    }

    pub(crate) fn challenged_assertions(&self) -> Vec<([Address; 2], [U256; 2])> {
        self.lock().challenged.clone()
    }

    pub(crate) fn created_subscribers(&self) -> usize {
        self.lock().created_sinks.len()
    }

    pub(crate) async fn emit_assertion_created(&self, id: u64, asserter: Address) {
        self.emit_assertion_created_with(id, asserter, B256::ZERO, id)
            .await;
    }

    pub(crate) async fn emit_assertion_created_with(
        &self,
        id: u64,
        asserter: Address,
        vm_hash: B256,
        inbox_size: u64,
    ) {
        let sinks = self.lock().created_sinks.clone();
        let ev = AssertionCreatedEvent {
            assertion_id: U256::from(id),
            asserter,
            vm_hash,
            inbox_size: U256::from(inbox_size),
        };
        for sink in sinks {
            let _ = sink.send(ev.clone()).await;
        }
    }

    pub(crate) async fn emit_assertion_challenged(&self, id: u64, challenge_addr: Address) {
        let sinks = self.lock().challenged_sinks.clone();
        let ev = AssertionChallengedEvent {
            assertion_id: U256::from(id),
            challenge_addr,
        };
        for sink in sinks {
            let _ = sink.send(ev.clone()).await;
        }
    }
}

#[async_trait]
impl RollupClient for MockRollup {
    async fn staker_address(&self, operator: Address) -> Result<Address, ContractError> {
        Ok(operator)
    }

    async fn staker(&self, _staker: Address) -> Result<StakerStatus, ContractError> {
        Ok(self.lock().staker.clone())
    }

    async fn assertion(&self, id: U256) -> Result<AssertionState, ContractError> {
        let id = id.saturating_to::<u64>();
        Ok(self
            .lock()
            .assertions
            .get(&id)
            .cloned()
            .unwrap_or(AssertionState {
                state_hash: B256::ZERO,
                inbox_size: U256::ZERO,
                parent: U256::ZERO,
            }))
    }

    async fn zombie(&self, _index: U256) -> Result<Zombie, ContractError> {
        Ok(self.lock().zombie.clone())
    }

    async fn challenge_context(&self) -> Result<ChallengeContextState, ContractError> {
        Ok(ChallengeContextState {
            defender: Address::ZERO,
            challenger: Address::ZERO,
            completed: self.lock().challenge_completed,
        })
    }

    async fn is_staked(&self, _staker: Address) -> Result<bool, ContractError> {
        Ok(self.lock().staker.is_staked)
    }

    async fn stake(&self, _amount: U256, _operator: Address) -> Result<(), ContractError> {
        self.lock().staker.is_staked = true;
        Ok(())
    }

    async fn create_assertion(
        &self,
        vm_hash: B256,
        inbox_size: U256,
    ) -> Result<(), ContractError> {
        self.lock().created.push((vm_hash, inbox_size));
        Ok(())
    }

    async fn advance_stake(&self, id: U256) -> Result<u128, ContractError> {
        let mut inner = self.lock();
        inner.advanced.push(id.saturating_to());
        inner.staker.assertion_id = id;
        Ok(21_000)
    }

    async fn challenge_assertion(
        &self,
        players: [Address; 2],
        assertion_ids: [U256; 2],
    ) -> Result<(), ContractError> {
        self.lock().challenged.push((players, assertion_ids));
        Ok(())
    }

    async fn subscribe_assertion_created(
        &self,
        sink: mpsc::Sender<AssertionCreatedEvent>,
    ) -> Result<(), ContractError> {
        self.lock().created_sinks.push(sink);
        Ok(())
    }

    async fn subscribe_assertion_challenged(
        &self,
        sink: mpsc::Sender<AssertionChallengedEvent>,
    ) -> Result<(), ContractError> {
        self.lock().challenged_sinks.push(sink);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock challenge session and manager
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MockChallengeSessionInner {
    responder: Address,
    time_left: u64,
    time_left_queries: u64,
    current_bisected: Option<BisectedEvent>,
    bisections: Vec<([B256; 3], u64, u64, u64, u64, u64)>,
    proofs: Vec<(u64, u64, u64)>,
    timeout_calls: u64,
    bisected_sinks: Vec<mpsc::Sender<BisectedEvent>>,
    completed_sinks: Vec<mpsc::Sender<ChallengeCompletedEvent>>,
}

/// Recording mock of one [`ChallengeClient`] session.
#[derive(Debug, Default)]
pub(crate) struct MockChallengeSession {
    inner: Mutex<MockChallengeSessionInner>,
    shut_down: AtomicBool,
}

impl MockChallengeSession {
    fn lock(&self) -> std::sync::MutexGuard<'_, MockChallengeSessionInner> {
        self.inner.lock().expect("mock session lock")
    }

    pub(crate) fn set_responder(&self, responder: Address) {
        self.lock().responder = responder;
    }

    pub(crate) fn set_time_left(&self, blocks: u64) {
        self.lock().time_left = blocks;
    }

    pub(crate) fn set_current_bisected(&self, ev: BisectedEvent) {
        self.lock().current_bisected = Some(ev);
    }

    pub(crate) fn bisections(&self) -> Vec<([B256; 3], u64, u64, u64, u64, u64)> {
        self.lock().bisections.clone()
    }

    pub(crate) fn proofs(&self) -> Vec<(u64, u64, u64)> {
        self.lock().proofs.clone()
    }

    pub(crate) fn timeout_calls(&self) -> u64 {
        self.lock().timeout_calls
    }

    pub(crate) fn time_left_queries(&self) -> u64 {
        self.lock().time_left_queries
    }

    pub(crate) fn bisected_subscribers(&self) -> usize {
        self.lock().bisected_sinks.len()
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub(crate) async fn emit_bisected(&self, ev: BisectedEvent) {
        let sinks = self.lock().bisected_sinks.clone();
        for sink in sinks {
            let _ = sink.send(ev.clone()).await;
        }
    }

    pub(crate) async fn emit_completed(&self, ev: ChallengeCompletedEvent) {
        let sinks = self.lock().completed_sinks.clone();
        for sink in sinks {
            let _ = sink.send(ev.clone()).await;
        }
    }
}

#[async_trait]
impl ChallengeClient for MockChallengeSession {
    async fn current_responder(&self) -> Result<Address, ContractError> {
        Ok(self.lock().responder)
    }

    async fn current_responder_time_left(&self) -> Result<u64, ContractError> {
        let mut inner = self.lock();
        inner.time_left_queries += 1;
        Ok(inner.time_left)
    }

    async fn current_bisected(&self) -> Result<BisectedEvent, ContractError> {
        self.lock()
            .current_bisected
            .clone()
            .ok_or_else(|| ContractError::Call("no bisection recorded".into()))
    }

    async fn bisect_execution(
        &self,
        bisection: [B256; 3],
        challenge_index: u64,
        new_start: u64,
        new_length: u64,
        prev_start: u64,
        prev_length: u64,
    ) -> Result<(), ContractError> {
        self.lock().bisections.push((
            bisection,
            challenge_index,
            new_start,
            new_length,
            prev_start,
            prev_length,
        ));
        Ok(())
    }

    async fn verify_one_step_proof(
        &self,
        _ctx: &crate::proof::VerificationContext,
        _proof: &crate::proof::OneStepProof,
        step_index: u64,
        prev_start: u64,
        prev_length: u64,
    ) -> Result<(), ContractError> {
        self.lock().proofs.push((step_index, prev_start, prev_length));
        Ok(())
    }

    async fn timeout(&self) -> Result<(), ContractError> {
        self.lock().timeout_calls += 1;
        Ok(())
    }

    async fn subscribe_bisected(
        &self,
        sink: mpsc::Sender<BisectedEvent>,
    ) -> Result<(), ContractError> {
        self.lock().bisected_sinks.push(sink);
        Ok(())
    }

    async fn subscribe_challenge_completed(
        &self,
        sink: mpsc::Sender<ChallengeCompletedEvent>,
    ) -> Result<(), ContractError> {
        self.lock().completed_sinks.push(sink);
        Ok(())
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

/// Manager that hands out the same mock session for every address.
#[derive(Debug)]
pub(crate) struct MockChallengeManager {
    session: Arc<MockChallengeSession>,
}

impl MockChallengeManager {
    pub(crate) fn new(session: Arc<MockChallengeSession>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl ChallengeManager for MockChallengeManager {
    async fn session(
        &self,
        _address: Address,
    ) -> Result<Arc<dyn ChallengeClient>, ContractError> {
        Ok(Arc::clone(&self.session) as Arc<dyn ChallengeClient>)
    }
}

// ---------------------------------------------------------------------------
// Mock L1 client
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct MockL1Inner {
    block_number: u64,
    head_sinks: Vec<mpsc::Sender<L1Head>>,
}

/// Mock of [`L1Client`] with injectable heads.
#[derive(Debug, Default)]
pub(crate) struct MockL1 {
    inner: Mutex<MockL1Inner>,
}

impl MockL1 {
    pub(crate) async fn emit_head(&self, number: u64) {
        let sinks = {
            let mut inner = self.inner.lock().expect("mock l1 lock");
            inner.block_number = number;
            inner.head_sinks.clone()
        };
        let head = L1Head {
            number,
            hash: B256::ZERO,
            timestamp: 0,
        };
        for sink in sinks {
            let _ = sink.send(head).await;
        }
    }
}

#[async_trait]
impl L1Client for MockL1 {
    async fn block_number(&self) -> RpcResult<u64> {
        Ok(self.inner.lock().expect("mock l1 lock").block_number)
    }

    async fn balance(&self, _address: Address) -> RpcResult<U256> {
        Ok(U256::ZERO)
    }

    async fn subscribe_new_heads(&self, sink: mpsc::Sender<L1Head>) -> RpcResult<()> {
        self.inner.lock().expect("mock l1 lock").head_sinks.push(sink);
        Ok(())
    }
}
