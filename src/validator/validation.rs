//! Validation loop: watches new assertions, advances stake on agreement,
//! opens a challenge on disagreement.

use std::sync::Arc;

use alloy_primitives::{Address, U256};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::backend::Backend;
use crate::config::ValidatorConfig;
use crate::constants::{EVENT_CHANNEL_CAPACITY, RPC_RETRY_DELAY};
use crate::contracts::{AssertionCreatedEvent, ContractError, RollupClient, StakerStatus};
use crate::metrics;
use crate::rpc::L1Client;
use crate::store::{Assertion, ChallengeContext, ChallengeStore};
use crate::validator::sleep_or_cancel;

pub(crate) struct ValidationLoop {
    cfg: ValidatorConfig,
    backend: Arc<dyn Backend>,
    rollup: Arc<dyn RollupClient>,
    l1: Arc<dyn L1Client>,
    store: ChallengeStore,
    challenge_tx: mpsc::Sender<ChallengeContext>,
    resolution_rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
}

impl ValidationLoop {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        cfg: ValidatorConfig,
        backend: Arc<dyn Backend>,
        rollup: Arc<dyn RollupClient>,
        l1: Arc<dyn L1Client>,
        store: ChallengeStore,
        challenge_tx: mpsc::Sender<ChallengeContext>,
        resolution_rx: mpsc::Receiver<()>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            cfg,
            backend,
            rollup,
            l1,
            store,
            challenge_tx,
            resolution_rx,
            cancel,
        }
    }

    pub(crate) async fn run(mut self) {
        let (created_tx, mut created_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        if let Err(err) = self.rollup.subscribe_assertion_created(created_tx).await {
            error!(error = %err, "failed to subscribe to assertion events");
            return;
        }

        // A persisted context means we crashed mid-challenge; resume in the
        // in-challenge state and let the challenge loop recover the details.
        let mut in_challenge = match self.store.read_with_retry(3).await {
            Ok(ctx) => ctx.is_some(),
            Err(err) => {
                error!(error = %err, "failed to read persisted challenge context");
                false
            }
        };

        loop {
            let staker = match self.refresh_staker().await {
                Ok(staker) => staker,
                Err(err) => {
                    warn!(error = %err, "failed to refresh staker status");
                    if !sleep_or_cancel(&self.cancel, RPC_RETRY_DELAY).await {
                        return;
                    }
                    continue;
                }
            };

            if in_challenge {
                tokio::select! {
                    () = self.cancel.cancelled() => return,
                    Some(()) = self.resolution_rx.recv() => {
                        info!("challenge resolved, returning to idle");
                        if let Err(err) = self.store.clear() {
                            error!(error = %err, "failed to delete challenge context");
                        }
                        in_challenge = false;
                    }
                }
            } else {
                tokio::select! {
                    () = self.cancel.cancelled() => return,
                    Some(ev) = created_rx.recv() => {
                        if self.on_assertion_created(&staker, ev).await {
                            in_challenge = true;
                        }
                    }
                }
            }
        }
    }

    async fn refresh_staker(&self) -> Result<StakerStatus, ContractError> {
        let staker_addr = self.rollup.staker_address(self.cfg.stake_addr).await?;
        self.rollup.staker(staker_addr).await
    }

    /// Handles one `AssertionCreated` event; returns true when a challenge
    /// was opened.
    async fn on_assertion_created(
        &self,
        staker: &StakerStatus,
        ev: AssertionCreatedEvent,
    ) -> bool {
        metrics::record_assertion_observed(ev.assertion_id, ev.inbox_size);

        // Never stack a second dispute onto an open challenge.
        if staker.current_challenge != Address::ZERO {
            return false;
        }
        // Hold back while a defeated staker still awaits cleanup.
        if let Ok(zombie) = self.rollup.zombie(U256::ZERO).await {
            if zombie.staker_address != Address::ZERO {
                return false;
            }
        }
        if ev.asserter == self.cfg.stake_addr {
            info!(asserter = %ev.asserter, "own assertion observed, skipping");
            return false;
        }

        info!(assertion_id = %ev.assertion_id, "new assertion, checking against local chain");

        let mut check_id = staker.assertion_id.saturating_to::<u64>() + 1;
        let target = ev.assertion_id.saturating_to::<u64>();
        while check_id <= target {
            let assertion = match self.rollup.assertion(U256::from(check_id)).await {
                Ok(assertion) => assertion,
                Err(err) => {
                    error!(error = %err, assertion_id = check_id, "failed to fetch assertion");
                    break;
                }
            };
            // Deleted assertions keep their slot with a zeroed inbox size.
            if assertion.inbox_size.is_zero() {
                check_id += 1;
                continue;
            }

            let height = assertion.inbox_size.saturating_to::<u64>();
            let header = match self.backend.header_by_number(height).await {
                Ok(header) => header,
                Err(err) => {
                    error!(error = %err, height, "failed to fetch local block");
                    break;
                }
            };

            if assertion.state_hash != header.state_root {
                info!(
                    assertion_id = check_id,
                    claimed = %assertion.state_hash,
                    local = %header.state_root,
                    "assertion disagrees with local state root, opening challenge"
                );
                let ctx = ChallengeContext {
                    opponent_assertion: Assertion {
                        id: U256::from(check_id),
                        vm_hash: assertion.state_hash,
                        inbox_size: assertion.inbox_size,
                        parent: assertion.parent,
                    },
                    our_assertion: Assertion {
                        id: U256::ZERO,
                        vm_hash: header.state_root,
                        inbox_size: assertion.inbox_size,
                        parent: assertion.parent,
                    },
                };
                if let Err(err) = self.store.write(&ctx) {
                    error!(error = %err, "UNHANDLED: cannot persist challenge context, validator state corrupted");
                    break;
                }
                metrics::record_challenge_opened();
                if self.challenge_tx.send(ctx).await.is_err() {
                    return false;
                }
                return true;
            }

            // Agreement: move our stake onto the assertion.
            info!(assertion_id = check_id, "assertion verified, advancing stake");
            match self.rollup.advance_stake(U256::from(check_id)).await {
                Ok(fee_wei) => {
                    metrics::record_advanced(check_id, fee_wei);
                    if let Ok(balance) = self.l1.balance(self.cfg.stake_addr).await {
                        metrics::record_balance(balance);
                    }
                }
                Err(err) => {
                    error!(error = %err, "UNHANDLED: cannot advance stake, validator state corrupted");
                    break;
                }
            }
            check_id += 1;
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        wait_for, MemoryKv, MockL1, MockRollup, TestChain, TestTx,
    };
    use alloy_primitives::B256;
    use std::time::Duration;

    struct Fixture {
        rollup: Arc<MockRollup>,
        store: ChallengeStore,
        challenge_rx: mpsc::Receiver<ChallengeContext>,
        resolution_tx: mpsc::Sender<()>,
        cancel: CancellationToken,
    }

    async fn spawn_loop(
        chain: TestChain,
        rollup: Arc<MockRollup>,
        store: ChallengeStore,
    ) -> Fixture {
        let cfg = ValidatorConfig {
            stake_addr: Address::repeat_byte(0x01),
            sequencer_addr: Address::repeat_byte(0x02),
            ..Default::default()
        };
        let (challenge_tx, challenge_rx) = mpsc::channel(1);
        let (resolution_tx, resolution_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        let validation = ValidationLoop::new(
            cfg,
            Arc::new(chain),
            Arc::clone(&rollup) as Arc<dyn RollupClient>,
            Arc::new(MockL1::default()),
            store.clone(),
            challenge_tx,
            resolution_rx,
            cancel.clone(),
        );
        tokio::spawn(validation.run());

        // Events emitted before the loop subscribes would be lost.
        let subscribed = Arc::clone(&rollup);
        wait_for(move || subscribed.created_subscribers() > 0).await;

        Fixture {
            rollup,
            store,
            challenge_rx,
            resolution_tx,
            cancel,
        }
    }

    fn fresh_store() -> ChallengeStore {
        ChallengeStore::new(Arc::new(MemoryKv::default()))
    }

    /// A chain of five blocks whose roots the mock rollup asserts.
    fn agreeing_setup() -> (TestChain, Arc<MockRollup>) {
        let chain = TestChain::builder()
            .block(vec![TestTx::transfer()])
            .block(vec![TestTx::transfer()])
            .block(vec![])
            .block(vec![TestTx::transfer()])
            .block(vec![])
            .build();
        let rollup = Arc::new(MockRollup::default());
        for id in 1..=5u64 {
            let root = chain.state_root_at(id);
            rollup.put_assertion(id, root, id, id - 1);
        }
        (chain, rollup)
    }

    #[tokio::test]
    async fn agree_and_advance_through_all_assertions() {
        // Scenario S1: five matching assertions, expect five advances and no
        // challenge.
        let (chain, rollup) = agreeing_setup();
        let mut fixture = spawn_loop(chain, rollup, fresh_store()).await;

        fixture
            .rollup
            .emit_assertion_created(5, Address::repeat_byte(0x99))
            .await;

        wait_for(|| fixture.rollup.advanced() == vec![1, 2, 3, 4, 5]).await;
        assert!(fixture.challenge_rx.try_recv().is_err());
        assert!(!fixture.store.exists().unwrap());
        fixture.cancel.cancel();
    }

    #[tokio::test]
    async fn disagreement_opens_challenge() {
        // Scenario S2: assertion 3 claims a wrong root.
        let (chain, rollup) = agreeing_setup();
        rollup.put_assertion(3, B256::repeat_byte(0xbe), 3, 2);
        let mut fixture = spawn_loop(chain, rollup, fresh_store()).await;

        fixture
            .rollup
            .emit_assertion_created(5, Address::repeat_byte(0x99))
            .await;

        let ctx = tokio::time::timeout(Duration::from_secs(2), fixture.challenge_rx.recv())
            .await
            .expect("challenge handoff")
            .expect("open channel");

        // Advanced only up to the disagreement.
        assert_eq!(fixture.rollup.advanced(), vec![1, 2]);
        assert_eq!(ctx.opponent_assertion.id, U256::from(3));
        assert_eq!(ctx.opponent_assertion.vm_hash, B256::repeat_byte(0xbe));
        assert_eq!(ctx.our_assertion.inbox_size, U256::from(3));
        assert_ne!(ctx.our_assertion.vm_hash, ctx.opponent_assertion.vm_hash);

        // The context is durable before the handoff.
        assert_eq!(fixture.store.read().unwrap(), Some(ctx));
        fixture.cancel.cancel();
    }

    #[tokio::test]
    async fn replaying_old_assertion_is_idempotent() {
        // Invariant 5: an event at or below our staked assertion writes
        // nothing on-chain.
        let (chain, rollup) = agreeing_setup();
        rollup.set_staked_assertion(5);
        let fixture = spawn_loop(chain, rollup, fresh_store()).await;

        fixture
            .rollup
            .emit_assertion_created(3, Address::repeat_byte(0x99))
            .await;

        // Give the loop a chance to misbehave, then check nothing happened.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fixture.rollup.advanced().is_empty());
        assert!(!fixture.store.exists().unwrap());
        fixture.cancel.cancel();
    }

    #[tokio::test]
    async fn own_assertions_are_ignored() {
        let (chain, rollup) = agreeing_setup();
        let fixture = spawn_loop(chain, rollup, fresh_store()).await;

        // Asserter is our own stake address.
        fixture
            .rollup
            .emit_assertion_created(5, Address::repeat_byte(0x01))
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fixture.rollup.advanced().is_empty());
        fixture.cancel.cancel();
    }

    #[tokio::test]
    async fn zombie_staker_defers_validation() {
        let (chain, rollup) = agreeing_setup();
        rollup.set_zombie(Address::repeat_byte(0x66));
        let fixture = spawn_loop(chain, rollup, fresh_store()).await;

        fixture
            .rollup
            .emit_assertion_created(5, Address::repeat_byte(0x99))
            .await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fixture.rollup.advanced().is_empty());
        fixture.cancel.cancel();
    }

    #[tokio::test]
    async fn deleted_assertions_are_skipped() {
        let (chain, rollup) = agreeing_setup();
        // Assertion 2 deleted: zero inbox size.
        rollup.put_assertion(2, B256::ZERO, 0, 1);
        let fixture = spawn_loop(chain, rollup, fresh_store()).await;

        fixture
            .rollup
            .emit_assertion_created(5, Address::repeat_byte(0x99))
            .await;

        wait_for(|| fixture.rollup.advanced() == vec![1, 3, 4, 5]).await;
        fixture.cancel.cancel();
    }

    #[tokio::test]
    async fn resolution_deletes_context_and_returns_to_idle() {
        // Invariant 6 at the loop level: after the resolution signal the
        // persisted key is gone and validation resumes.
        let (chain, rollup) = agreeing_setup();
        let store = fresh_store();

        // A challenge is in flight: the context must be durable before the
        // loop starts so it resumes in the in-challenge state.
        let ctx = ChallengeContext {
            opponent_assertion: Assertion {
                id: U256::from(3),
                vm_hash: B256::repeat_byte(0xbe),
                inbox_size: U256::from(3),
                parent: U256::from(2),
            },
            our_assertion: Assertion {
                id: U256::ZERO,
                vm_hash: B256::repeat_byte(0xaf),
                inbox_size: U256::from(3),
                parent: U256::from(2),
            },
        };
        store.write(&ctx).unwrap();
        let fixture = spawn_loop(chain, rollup, store).await;

        fixture.resolution_tx.send(()).await.unwrap();

        wait_for(|| !fixture.store.exists().unwrap()).await;
        fixture.cancel.cancel();
    }
}
