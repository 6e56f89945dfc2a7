//! The validator service: staking bootstrap and the two cooperating loops.
//!
//! The validation loop (C6) watches new assertions and either advances our
//! stake or opens a challenge; the challenge loop (C7) drives an open
//! challenge to resolution. They communicate exclusively over two one-slot
//! channels — `challenge` (entry) and `resolution` (teardown) — which also
//! serve as the mutual-exclusion for the logical "we are challenging" flag.

pub mod challenge;
pub mod validation;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::backend::Backend;
use crate::config::ValidatorConfig;
use crate::contracts::{ChallengeManager, RollupClient};
use crate::error::ValidatorResult;
use crate::rpc::L1Client;
use crate::store::ChallengeStore;

use challenge::ChallengeLoop;
use validation::ValidationLoop;

/// The assembled validator service.
pub struct Validator {
    cfg: ValidatorConfig,
    backend: Arc<dyn Backend>,
    rollup: Arc<dyn RollupClient>,
    challenges: Arc<dyn ChallengeManager>,
    l1: Arc<dyn L1Client>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("stake_addr", &self.cfg.stake_addr)
            .field("rollup_addr", &self.cfg.rollup_addr)
            .finish_non_exhaustive()
    }
}

impl Validator {
    /// Builds the service from its collaborators after validating the
    /// configuration.
    pub fn new(
        cfg: ValidatorConfig,
        backend: Arc<dyn Backend>,
        rollup: Arc<dyn RollupClient>,
        challenges: Arc<dyn ChallengeManager>,
        l1: Arc<dyn L1Client>,
        cancel: CancellationToken,
    ) -> ValidatorResult<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            backend,
            rollup,
            challenges,
            l1,
            cancel,
        })
    }

    /// Bonds our stake if needed and spawns both loops.
    pub async fn start(self) -> ValidatorResult<ValidatorHandle> {
        self.ensure_staked().await?;

        let store = ChallengeStore::new(self.backend.chain_db());

        // One-slot handoff channels; no concurrent challenges exist.
        let (challenge_tx, challenge_rx) = mpsc::channel(1);
        let (resolution_tx, resolution_rx) = mpsc::channel(1);

        let validation = ValidationLoop::new(
            self.cfg.clone(),
            Arc::clone(&self.backend),
            Arc::clone(&self.rollup),
            Arc::clone(&self.l1),
            store.clone(),
            challenge_tx.clone(),
            resolution_rx,
            self.cancel.clone(),
        );
        let challenge = ChallengeLoop::new(
            self.cfg.clone(),
            Arc::clone(&self.backend),
            Arc::clone(&self.rollup),
            Arc::clone(&self.challenges),
            Arc::clone(&self.l1),
            store,
            challenge_rx,
            challenge_tx,
            resolution_tx,
            self.cancel.clone(),
        );

        let handle = ValidatorHandle {
            validation: tokio::spawn(validation.run()),
            challenge: tokio::spawn(challenge.run()),
            cancel: self.cancel,
        };
        info!(
            chain_id = self.backend.chain_config().chain_id,
            "validator started"
        );
        Ok(handle)
    }

    async fn ensure_staked(&self) -> ValidatorResult<()> {
        if self.rollup.is_staked(self.cfg.stake_addr).await? {
            return Ok(());
        }
        info!(amount = %self.cfg.stake_amount, "posting initial stake");
        self.rollup
            .stake(self.cfg.stake_amount, self.cfg.stake_addr)
            .await?;
        Ok(())
    }
}

/// Running validator tasks.
#[derive(Debug)]
pub struct ValidatorHandle {
    validation: JoinHandle<()>,
    challenge: JoinHandle<()>,
    cancel: CancellationToken,
}

impl ValidatorHandle {
    /// The root cancellation token of the service.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancels both loops and waits for them to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.validation.await;
        let _ = self.challenge.await;
        info!("validator stopped");
    }
}

/// Sleeps for `delay` unless `cancel` fires first; returns false on cancel.
pub(crate) async fn sleep_or_cancel(
    cancel: &CancellationToken,
    delay: std::time::Duration,
) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(delay) => true,
    }
}
