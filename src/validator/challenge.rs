//! Challenge loop: drives a single open challenge to resolution.
//!
//! On entry the loop materializes the state vector over the disputed block
//! range, then answers each `Bisected` event when it is our turn, calls
//! `timeout()` when the opponent's clock expires, and tears down on
//! `ChallengeCompleted`. Crash recovery runs before normal processing: the
//! persisted challenge context is case-split against L1 truth and the
//! missing events are re-injected into the loop's own channels.

use std::sync::Arc;

use alloy_primitives::Address;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::backend::Backend;
use crate::bisection::{self, BisectionMove};
use crate::config::ValidatorConfig;
use crate::constants::EVENT_CHANNEL_CAPACITY;
use crate::contracts::{
    AssertionChallengedEvent, AssertionCreatedEvent, BisectedEvent, ChallengeClient,
    ChallengeCompletedEvent, ChallengeManager, RollupClient,
};
use crate::error::ValidatorResult;
use crate::proof::{
    generate_proof, generate_states, ExecutionState, ProverConfig, VerificationContext,
};
use crate::rpc::{L1Client, L1Head};
use crate::store::{ChallengeContext, ChallengeStore};

pub(crate) struct ChallengeLoop {
    cfg: ValidatorConfig,
    backend: Arc<dyn Backend>,
    rollup: Arc<dyn RollupClient>,
    challenges: Arc<dyn ChallengeManager>,
    l1: Arc<dyn L1Client>,
    store: ChallengeStore,
    challenge_rx: mpsc::Receiver<ChallengeContext>,
    challenge_tx: mpsc::Sender<ChallengeContext>,
    resolution_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
}

impl ChallengeLoop {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        cfg: ValidatorConfig,
        backend: Arc<dyn Backend>,
        rollup: Arc<dyn RollupClient>,
        challenges: Arc<dyn ChallengeManager>,
        l1: Arc<dyn L1Client>,
        store: ChallengeStore,
        challenge_rx: mpsc::Receiver<ChallengeContext>,
        challenge_tx: mpsc::Sender<ChallengeContext>,
        resolution_tx: mpsc::Sender<()>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cfg,
            backend,
            rollup,
            challenges,
            l1,
            store,
            challenge_rx,
            challenge_tx,
            resolution_tx,
            cancel,
        }
    }

    fn prover_config(&self) -> ProverConfig {
        ProverConfig {
            reexec: self.cfg.reexec,
        }
    }

    pub(crate) async fn run(mut self) {
        let (created_tx, mut created_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (challenged_tx, mut challenged_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (head_tx, mut head_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (bisected_tx, mut bisected_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (completed_tx, mut completed_rx) =
            mpsc::channel::<ChallengeCompletedEvent>(EVENT_CHANNEL_CAPACITY);

        if let Err(err) = self
            .rollup
            .subscribe_assertion_created(created_tx.clone())
            .await
        {
            error!(error = %err, "failed to subscribe to assertion events");
            return;
        }
        if let Err(err) = self
            .rollup
            .subscribe_assertion_challenged(challenged_tx.clone())
            .await
        {
            error!(error = %err, "failed to subscribe to challenge events");
            return;
        }
        if let Err(err) = self.l1.subscribe_new_heads(head_tx).await {
            error!(error = %err, "failed to subscribe to L1 heads");
            return;
        }

        let mut session: Option<Arc<dyn ChallengeClient>> = None;
        let mut states: Vec<ExecutionState> = Vec::new();
        let mut in_challenge = false;
        let mut opponent_timeout_block: u64 = 0;

        // Crash recovery: the persisted context tells us a challenge was in
        // flight; L1 truth tells us how far it got.
        let (mut ctx, mut restart) = self.recover(&created_tx, &challenged_tx).await;

        loop {
            if in_challenge {
                tokio::select! {
                    () = self.cancel.cancelled() => {
                        if let Some(session) = session.take() {
                            session.shutdown();
                        }
                        return;
                    }
                    Some(ev) = bisected_rx.recv() => {
                        if let Some(session) = session.as_ref() {
                            self.on_bisected(session, &states, &ev, &mut opponent_timeout_block)
                                .await;
                        }
                    }
                    Some(head) = head_rx.recv() => {
                        if let Some(session) = session.as_ref() {
                            self.on_head(session, head, opponent_timeout_block).await;
                        }
                    }
                    Some(ev) = completed_rx.recv() => {
                        info!(winner = %ev.winner, loser = %ev.loser, "challenge completed");
                        if let Some(session) = session.take() {
                            session.shutdown();
                        }
                        states = Vec::new();
                        opponent_timeout_block = 0;
                        in_challenge = false;
                        let _ = self.resolution_tx.send(()).await;
                    }
                }
            } else {
                tokio::select! {
                    () = self.cancel.cancelled() => return,
                    Some(new_ctx) = self.challenge_rx.recv() => {
                        info!(
                            vm_hash = %new_ctx.our_assertion.vm_hash,
                            inbox_size = %new_ctx.our_assertion.inbox_size,
                            "creating assertion for challenge"
                        );
                        if let Err(err) = self
                            .rollup
                            .create_assertion(
                                new_ctx.our_assertion.vm_hash,
                                new_ctx.our_assertion.inbox_size,
                            )
                            .await
                        {
                            error!(error = %err, "UNHANDLED: cannot create assertion for challenge, validator state corrupted");
                            let _ = self.challenge_tx.send(new_ctx.clone()).await;
                        }
                        ctx = Some(new_ctx);
                    }
                    Some(ev) = created_rx.recv() => {
                        if let Some(c) = ctx.as_mut() {
                            if ev.asserter == self.cfg.stake_addr
                                && ev.vm_hash == c.our_assertion.vm_hash
                            {
                                c.our_assertion.id = ev.assertion_id;
                                info!(
                                    opponent = %c.opponent_assertion.id,
                                    ours = %ev.assertion_id,
                                    "our assertion created, opening challenge"
                                );
                                if let Err(err) = self
                                    .rollup
                                    .challenge_assertion(
                                        [self.cfg.sequencer_addr, self.cfg.stake_addr],
                                        [c.opponent_assertion.id, ev.assertion_id],
                                    )
                                    .await
                                {
                                    error!(error = %err, "UNHANDLED: cannot start challenge, validator state corrupted");
                                    let _ = created_tx.send(ev).await;
                                }
                            }
                        }
                    }
                    Some(ev) = challenged_rx.recv() => {
                        let Some(c) = ctx.as_ref() else { continue };
                        info!(
                            assertion_id = %ev.assertion_id,
                            expected = %c.opponent_assertion.id,
                            challenge = %ev.challenge_addr,
                            "observed new challenge"
                        );
                        if ev.assertion_id != c.opponent_assertion.id {
                            continue;
                        }
                        match self
                            .enter_challenge(&ev, c, &bisected_tx, &completed_tx, restart)
                            .await
                        {
                            Ok((new_session, vector)) => {
                                session = Some(new_session);
                                states = vector;
                                restart = false;
                                in_challenge = true;
                            }
                            Err(err) => {
                                error!(error = %err, "failed to enter challenge, requeueing");
                                let _ = challenged_tx.send(ev).await;
                            }
                        }
                    }
                    // Heads are irrelevant outside a challenge; keep the
                    // channel drained.
                    Some(_) = head_rx.recv() => {}
                }
            }
        }
    }

    /// Case-splits the persisted context against L1 state and re-injects the
    /// event that resumes the challenge from where it stopped.
    async fn recover(
        &self,
        created_tx: &mpsc::Sender<AssertionCreatedEvent>,
        challenged_tx: &mpsc::Sender<AssertionChallengedEvent>,
    ) -> (Option<ChallengeContext>, bool) {
        let saved = match self.store.read_with_retry(3).await {
            Ok(Some(saved)) => saved,
            Ok(None) => return (None, false),
            Err(err) => {
                error!(error = %err, "failed to read persisted challenge context");
                return (None, false);
            }
        };
        info!(
            opponent = %saved.opponent_assertion.id,
            inbox_size = %saved.our_assertion.inbox_size,
            "resuming persisted challenge"
        );

        let staker_addr = match self.rollup.staker_address(self.cfg.stake_addr).await {
            Ok(addr) => addr,
            Err(err) => {
                error!(error = %err, "recovery: failed to resolve staker address");
                return (None, false);
            }
        };
        let staker = match self.rollup.staker(staker_addr).await {
            Ok(staker) => staker,
            Err(err) => {
                error!(error = %err, "recovery: failed to fetch staker");
                return (None, false);
            }
        };
        let current = match self.rollup.assertion(staker.assertion_id).await {
            Ok(assertion) => assertion,
            Err(err) => {
                error!(error = %err, "recovery: failed to fetch staked assertion");
                return (None, false);
            }
        };
        let completed = self
            .rollup
            .challenge_context()
            .await
            .map(|c| c.completed)
            .unwrap_or(false);

        if current.inbox_size < saved.our_assertion.inbox_size
            && current.state_hash != saved.our_assertion.vm_hash
        {
            // Crashed before our counter-assertion was created.
            info!("recovery: assertion not yet created");
            let _ = self.challenge_tx.send(saved.clone()).await;
        } else if staker.current_challenge == Address::ZERO {
            // Assertion exists but the challenge was never opened; replay
            // our own creation event.
            info!("recovery: challenge not yet opened");
            let _ = created_tx
                .send(AssertionCreatedEvent {
                    assertion_id: staker.assertion_id,
                    asserter: self.cfg.stake_addr,
                    vm_hash: current.state_hash,
                    inbox_size: current.inbox_size,
                })
                .await;
        } else if completed {
            info!("recovery: challenge already completed");
            let _ = self.resolution_tx.send(()).await;
        } else {
            // Mid-bisection: replay the challenge-opened event and pick the
            // current bisection up from the contract.
            info!(challenge = %staker.current_challenge, "recovery: challenge in progress");
            let _ = challenged_tx
                .send(AssertionChallengedEvent {
                    assertion_id: saved.opponent_assertion.id,
                    challenge_addr: staker.current_challenge,
                })
                .await;
            return (Some(saved), true);
        }

        (Some(saved), false)
    }

    /// Binds a session to the new challenge contract and materializes the
    /// state vector over the disputed range.
    async fn enter_challenge(
        &self,
        ev: &AssertionChallengedEvent,
        ctx: &ChallengeContext,
        bisected_tx: &mpsc::Sender<BisectedEvent>,
        completed_tx: &mpsc::Sender<ChallengeCompletedEvent>,
        restart: bool,
    ) -> ValidatorResult<(Arc<dyn ChallengeClient>, Vec<ExecutionState>)> {
        let session = self.challenges.session(ev.challenge_addr).await?;

        let result = self
            .setup_session(&session, ctx, bisected_tx, completed_tx, restart)
            .await;
        match result {
            Ok(states) => Ok((session, states)),
            Err(err) => {
                session.shutdown();
                Err(err)
            }
        }
    }

    async fn setup_session(
        &self,
        session: &Arc<dyn ChallengeClient>,
        ctx: &ChallengeContext,
        bisected_tx: &mpsc::Sender<BisectedEvent>,
        completed_tx: &mpsc::Sender<ChallengeCompletedEvent>,
        restart: bool,
    ) -> ValidatorResult<Vec<ExecutionState>> {
        session.subscribe_bisected(bisected_tx.clone()).await?;
        session
            .subscribe_challenge_completed(completed_tx.clone())
            .await?;

        let parent = self.rollup.assertion(ctx.our_assertion.parent).await?;
        info!(
            parent_inbox = %parent.inbox_size,
            our_inbox = %ctx.our_assertion.inbox_size,
            "materializing state vector"
        );
        let states = generate_states(
            self.backend.as_ref(),
            parent.inbox_size.saturating_to(),
            ctx.our_assertion.inbox_size.saturating_to(),
            &self.prover_config(),
        )
        .await?;
        info!(
            first = %states[0].hash(),
            last = %states[states.len() - 1].hash(),
            count = states.len(),
            "state vector ready"
        );

        if restart {
            let current = session.current_bisected().await?;
            let _ = bisected_tx.send(current).await;
        }

        Ok(states)
    }

    async fn on_bisected(
        &self,
        session: &Arc<dyn ChallengeClient>,
        states: &[ExecutionState],
        ev: &BisectedEvent,
        opponent_timeout_block: &mut u64,
    ) {
        info!(
            segment_start = ev.segment_start,
            segment_length = ev.segment_length,
            "observed bisection"
        );
        let responder = match session.current_responder().await {
            Ok(responder) => responder,
            Err(err) => {
                error!(error = %err, "cannot get current responder");
                return;
            }
        };

        if responder == self.cfg.stake_addr {
            if let Err(err) = self.respond(session, states, ev).await {
                error!(error = %err, "cannot respond to bisection");
            }
        } else {
            let time_left = match session.current_responder_time_left().await {
                Ok(time_left) => time_left,
                Err(err) => {
                    error!(error = %err, "cannot get responder time left");
                    return;
                }
            };
            info!(blocks_left = time_left, "opponent's turn");
            *opponent_timeout_block = ev.raw_block_number + time_left;
        }
    }

    async fn on_head(
        &self,
        session: &Arc<dyn ChallengeClient>,
        head: L1Head,
        opponent_timeout_block: u64,
    ) {
        if opponent_timeout_block == 0 || head.number <= opponent_timeout_block {
            return;
        }
        info!(
            head = head.number,
            deadline = opponent_timeout_block,
            "opponent clock expired, claiming timeout"
        );
        if let Err(err) = session.timeout().await {
            error!(error = %err, "cannot timeout opponent");
        }
    }

    /// Runs the responder and submits its move.
    async fn respond(
        &self,
        session: &Arc<dyn ChallengeClient>,
        states: &[ExecutionState],
        ev: &BisectedEvent,
    ) -> ValidatorResult<()> {
        match bisection::respond(states, ev)? {
            BisectionMove::Bisect {
                bisection,
                challenge_index,
                new_start,
                new_length,
            } => {
                info!(challenge_index, new_start, new_length, "submitting bisection");
                session
                    .bisect_execution(
                        bisection,
                        challenge_index,
                        new_start,
                        new_length,
                        ev.segment_start,
                        ev.segment_length,
                    )
                    .await?;
            }
            BisectionMove::OneStep {
                state_index,
                step_index,
            } => {
                let state = &states[state_index];
                info!(state_index, step_index, "collapsed to one step, generating proof");
                let proof =
                    generate_proof(self.backend.as_ref(), state, &self.prover_config()).await?;
                let vctx = VerificationContext::build(self.backend.as_ref(), state).await?;
                session
                    .verify_one_step_proof(
                        &vctx,
                        &proof,
                        step_index,
                        ev.segment_start,
                        ev.segment_length,
                    )
                    .await?;
                info!("one-step proof submitted");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::StakerStatus;
    use crate::proof::ProverConfig;
    use crate::store::Assertion;
    use crate::test_utils::{
        wait_for, MemoryKv, MockChallengeManager, MockChallengeSession, MockL1, MockRollup,
        TestChain, TestTx,
    };
    use alloy_primitives::{B256, U256};
    use std::time::Duration;

    const OUR_ADDR: Address = Address::repeat_byte(0x01);
    const SEQ_ADDR: Address = Address::repeat_byte(0x02);
    const CHALLENGE_ADDR: Address = Address::repeat_byte(0x77);

    struct Fixture {
        rollup: Arc<MockRollup>,
        session: Arc<MockChallengeSession>,
        store: ChallengeStore,
        challenge_tx: mpsc::Sender<ChallengeContext>,
        resolution_rx: mpsc::Receiver<()>,
        l1: Arc<MockL1>,
        cancel: CancellationToken,
    }

    fn disputed_chain() -> TestChain {
        TestChain::builder()
            .block(vec![TestTx::transfer()])
            .block(vec![TestTx::contract_call(3)])
            .block(vec![TestTx::transfer()])
            .build()
    }

    async fn spawn_loop(
        chain: TestChain,
        rollup: Arc<MockRollup>,
        session: Arc<MockChallengeSession>,
        store: ChallengeStore,
    ) -> Fixture {
        let cfg = ValidatorConfig {
            stake_addr: OUR_ADDR,
            sequencer_addr: SEQ_ADDR,
            ..Default::default()
        };
        let (challenge_tx, challenge_rx) = mpsc::channel(1);
        let (resolution_tx, resolution_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let l1 = Arc::new(MockL1::default());

        let challenge = ChallengeLoop::new(
            cfg,
            Arc::new(chain),
            Arc::clone(&rollup) as Arc<dyn RollupClient>,
            Arc::new(MockChallengeManager::new(Arc::clone(&session))),
            Arc::clone(&l1) as Arc<dyn L1Client>,
            store.clone(),
            challenge_rx,
            challenge_tx.clone(),
            resolution_tx,
            cancel.clone(),
        );
        tokio::spawn(challenge.run());

        Fixture {
            rollup,
            session,
            store,
            challenge_tx,
            resolution_rx,
            l1,
            cancel,
        }
    }

    /// Context disputing assertion 2 over blocks [1, 2).
    fn context(chain: &TestChain) -> ChallengeContext {
        ChallengeContext {
            opponent_assertion: Assertion {
                id: U256::from(2),
                vm_hash: B256::repeat_byte(0xbe),
                inbox_size: U256::from(2),
                parent: U256::from(1),
            },
            our_assertion: Assertion {
                id: U256::ZERO,
                vm_hash: chain.state_root_at(2),
                inbox_size: U256::from(2),
                parent: U256::from(1),
            },
        }
    }

    /// Walks the loop from handoff through challenge entry.
    async fn enter_challenge(fixture: &Fixture, chain: &TestChain) {
        let ctx = context(chain);

        // Parent assertion 1 commits to block 1.
        fixture
            .rollup
            .put_assertion(1, chain.state_root_at(1), 1, 0);

        fixture.challenge_tx.send(ctx.clone()).await.unwrap();
        wait_for(|| {
            fixture.rollup.created_assertions()
                == vec![(ctx.our_assertion.vm_hash, U256::from(2))]
        })
        .await;

        // The rollup answers with our own AssertionCreated.
        fixture
            .rollup
            .emit_assertion_created_with(4, OUR_ADDR, ctx.our_assertion.vm_hash, 2)
            .await;
        wait_for(|| !fixture.rollup.challenged_assertions().is_empty()).await;

        // And with the AssertionChallenged event.
        fixture
            .rollup
            .emit_assertion_challenged(2, CHALLENGE_ADDR)
            .await;
        wait_for(|| fixture.session.bisected_subscribers() > 0).await;
    }

    #[tokio::test]
    async fn full_entry_opens_challenge_session() {
        let chain = disputed_chain();
        let rollup = Arc::new(MockRollup::default());
        let session = Arc::new(MockChallengeSession::default());
        let store = ChallengeStore::new(Arc::new(MemoryKv::default()));
        let fixture = spawn_loop(chain.clone(), rollup, session, store).await;

        enter_challenge(&fixture, &chain).await;

        assert_eq!(
            fixture.rollup.challenged_assertions(),
            vec![([SEQ_ADDR, OUR_ADDR], [U256::from(2), U256::from(4)])]
        );
        fixture.cancel.cancel();
    }

    #[tokio::test]
    async fn responds_with_bisection_when_our_turn() {
        let chain = disputed_chain();
        let rollup = Arc::new(MockRollup::default());
        let session = Arc::new(MockChallengeSession::default());
        session.set_responder(OUR_ADDR);
        let store = ChallengeStore::new(Arc::new(MemoryKv::default()));
        let fixture = spawn_loop(chain.clone(), rollup, session, store).await;

        enter_challenge(&fixture, &chain).await;

        // Build the expected local states to fabricate a disagreeing event.
        let states = generate_states(&chain, 1, 2, &ProverConfig::default())
            .await
            .unwrap();
        let ev = BisectedEvent {
            start_state: states[0].hash(),
            mid_state: B256::repeat_byte(0xbe),
            end_state: states[4].hash(),
            block_number: 100,
            block_time: 0,
            segment_start: 0,
            segment_length: 4,
            raw_block_number: 100,
        };
        fixture.session.emit_bisected(ev).await;

        wait_for(|| !fixture.session.bisections().is_empty()).await;
        let (bisection, challenge_index, new_start, new_length, prev_start, prev_length) =
            fixture.session.bisections()[0].clone();
        assert_eq!(challenge_index, 1);
        assert_eq!(new_start, 0);
        assert_eq!(new_length, 2);
        assert_eq!(prev_start, 0);
        assert_eq!(prev_length, 4);
        assert_eq!(bisection[0], states[0].hash());
        fixture.cancel.cancel();
    }

    #[tokio::test]
    async fn submits_one_step_proof_at_single_transition() {
        // Scenario S4: length 1, end differs.
        let chain = disputed_chain();
        let rollup = Arc::new(MockRollup::default());
        let session = Arc::new(MockChallengeSession::default());
        session.set_responder(OUR_ADDR);
        let store = ChallengeStore::new(Arc::new(MemoryKv::default()));
        let fixture = spawn_loop(chain.clone(), rollup, session, store).await;

        enter_challenge(&fixture, &chain).await;

        let states = generate_states(&chain, 1, 2, &ProverConfig::default())
            .await
            .unwrap();
        let ev = BisectedEvent {
            start_state: states[1].hash(),
            mid_state: states[2].hash(),
            end_state: B256::repeat_byte(0xbe),
            block_number: 101,
            block_time: 0,
            segment_start: 1,
            segment_length: 1,
            raw_block_number: 101,
        };
        fixture.session.emit_bisected(ev).await;

        wait_for(|| !fixture.session.proofs().is_empty()).await;
        let (step_index, prev_start, prev_length) = fixture.session.proofs()[0];
        assert_eq!(step_index, 2);
        assert_eq!(prev_start, 1);
        assert_eq!(prev_length, 1);
        fixture.cancel.cancel();
    }

    #[tokio::test]
    async fn claims_timeout_when_opponent_clock_expires() {
        // Scenario S5.
        let chain = disputed_chain();
        let rollup = Arc::new(MockRollup::default());
        let session = Arc::new(MockChallengeSession::default());
        // Opponent's turn, 10 blocks on the clock.
        session.set_responder(SEQ_ADDR);
        session.set_time_left(10);
        let store = ChallengeStore::new(Arc::new(MemoryKv::default()));
        let fixture = spawn_loop(chain.clone(), rollup, session, store).await;

        enter_challenge(&fixture, &chain).await;

        let states = generate_states(&chain, 1, 2, &ProverConfig::default())
            .await
            .unwrap();
        let ev = BisectedEvent {
            start_state: states[0].hash(),
            mid_state: states[2].hash(),
            end_state: states[4].hash(),
            block_number: 100,
            block_time: 0,
            segment_start: 0,
            segment_length: 4,
            raw_block_number: 100,
        };
        fixture.session.emit_bisected(ev).await;
        wait_for(|| fixture.session.time_left_queries() > 0).await;

        // Heads up to the deadline do not trigger the claim.
        fixture.l1.emit_head(110).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fixture.session.timeout_calls(), 0);

        // One block past the deadline does.
        fixture.l1.emit_head(111).await;
        wait_for(|| fixture.session.timeout_calls() == 1).await;
        fixture.cancel.cancel();
    }

    #[tokio::test]
    async fn completion_tears_down_and_signals_resolution() {
        let chain = disputed_chain();
        let rollup = Arc::new(MockRollup::default());
        let session = Arc::new(MockChallengeSession::default());
        let store = ChallengeStore::new(Arc::new(MemoryKv::default()));
        let mut fixture = spawn_loop(chain.clone(), rollup, session, store).await;

        enter_challenge(&fixture, &chain).await;

        fixture
            .session
            .emit_completed(ChallengeCompletedEvent {
                winner: OUR_ADDR,
                loser: SEQ_ADDR,
            })
            .await;

        tokio::time::timeout(Duration::from_secs(2), fixture.resolution_rx.recv())
            .await
            .expect("resolution signal")
            .expect("open channel");
        assert!(fixture.session.is_shut_down());
        fixture.cancel.cancel();
    }

    #[tokio::test]
    async fn crash_recovery_mid_bisection() {
        // Scenario S6: persisted context plus an on-chain challenge in
        // progress; expect a synthesized challenge entry and a replayed
        // bisection from currentBisected().
        let chain = disputed_chain();
        let rollup = Arc::new(MockRollup::default());
        let session = Arc::new(MockChallengeSession::default());
        session.set_responder(OUR_ADDR);

        let store = ChallengeStore::new(Arc::new(MemoryKv::default()));
        let ctx = context(&chain);
        store.write(&ctx).unwrap();

        // L1 truth: our assertion (id 4) exists and a challenge is open.
        rollup.put_assertion(1, chain.state_root_at(1), 1, 0);
        rollup.put_assertion(4, ctx.our_assertion.vm_hash, 2, 1);
        rollup.set_staker(StakerStatus {
            is_staked: true,
            amount_staked: U256::from(1),
            assertion_id: U256::from(4),
            current_challenge: CHALLENGE_ADDR,
        });

        // The contract reports the segment the crash interrupted: our local
        // mid will differ, so recovery must answer with a bisection.
        let states = generate_states(&chain, 1, 2, &ProverConfig::default())
            .await
            .unwrap();
        session.set_current_bisected(BisectedEvent {
            start_state: states[0].hash(),
            mid_state: B256::repeat_byte(0xbe),
            end_state: states[4].hash(),
            block_number: 50,
            block_time: 0,
            segment_start: 0,
            segment_length: 4,
            raw_block_number: 50,
        });

        let fixture = spawn_loop(chain.clone(), rollup, session, store).await;

        // Recovery resubscribes and replays the current bisection.
        wait_for(|| !fixture.session.bisections().is_empty()).await;
        let (_, challenge_index, new_start, new_length, ..) =
            fixture.session.bisections()[0].clone();
        assert_eq!((challenge_index, new_start, new_length), (1, 0, 2));
        fixture.cancel.cancel();
    }

    #[tokio::test]
    async fn crash_recovery_completed_challenge_signals_resolution() {
        let chain = disputed_chain();
        let rollup = Arc::new(MockRollup::default());
        let session = Arc::new(MockChallengeSession::default());

        let store = ChallengeStore::new(Arc::new(MemoryKv::default()));
        let ctx = context(&chain);
        store.write(&ctx).unwrap();

        rollup.put_assertion(4, ctx.our_assertion.vm_hash, 2, 1);
        rollup.set_staker(StakerStatus {
            is_staked: true,
            amount_staked: U256::from(1),
            assertion_id: U256::from(4),
            current_challenge: CHALLENGE_ADDR,
        });
        rollup.set_challenge_completed(true);

        let mut fixture = spawn_loop(chain.clone(), rollup, session, store).await;

        tokio::time::timeout(Duration::from_secs(2), fixture.resolution_rx.recv())
            .await
            .expect("resolution signal")
            .expect("open channel");
        fixture.cancel.cancel();
    }
}
