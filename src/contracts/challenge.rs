//! `Challenge` contract bindings: bisection moves, one-step proofs, and the
//! per-challenge session factory.

use std::sync::Arc;

use alloy::providers::DynProvider;
use alloy::sol;
use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use backon::Retryable;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryConfig;
use crate::contracts::ContractError;
use crate::proof::{OneStepProof, VerificationContext};

sol! {
    /// On-chain interactive challenge between two stakers.
    #[sol(rpc)]
    interface IChallenge {
        /// Transaction fields of a one-step proof preamble.
        struct EvmTransaction {
            uint256 nonce;
            uint256 gasPrice;
            uint256 gas;
            address to;
            uint256 value;
            bytes data;
            uint256 v;
            uint256 r;
            uint256 s;
        }

        /// Per-proof preamble consumed by the verifier.
        struct VerificationContext {
            address coinbase;
            uint256 timestamp;
            uint256 number;
            address origin;
            EvmTransaction transaction;
            bytes32 inputRoot;
            bytes32 txHash;
        }

        /// The challenged segment was narrowed.
        event Bisected(
            bytes32 startState,
            bytes32 midState,
            bytes32 endState,
            uint256 blockNum,
            uint256 blockTime,
            uint256 challengedSegmentStart,
            uint256 challengedSegmentLength
        );
        /// The challenge resolved.
        event ChallengeCompleted(address winner, address loser);

        function currentResponder() external view returns (address);
        function currentResponderTimeLeft() external view returns (uint256);
        function currentBisected() external view returns (
            bytes32 startState,
            bytes32 midState,
            bytes32 endState,
            uint256 blockNum,
            uint256 blockTime,
            uint256 challengedSegmentStart,
            uint256 challengedSegmentLength
        );
        function bisectExecution(
            bytes32[3] calldata bisection,
            uint256 challengedSegmentIndex,
            uint256 challengedSegmentStart,
            uint256 challengedSegmentLength,
            uint256 prevChallengedSegmentStart,
            uint256 prevChallengedSegmentLength
        ) external;
        function verifyOneStepProof(
            VerificationContext calldata ctx,
            uint8 verifierType,
            bytes calldata encoded,
            uint256 challengedStepIndex,
            uint256 prevChallengedSegmentStart,
            uint256 prevChallengedSegmentLength
        ) external;
        function timeout() external;
    }
}

/// `Bisected` as the challenge loop consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BisectedEvent {
    /// First state of the challenged segment.
    pub start_state: B256,
    /// Posted midpoint of the segment.
    pub mid_state: B256,
    /// Last state of the segment.
    pub end_state: B256,
    /// L1 block number recorded by the contract.
    pub block_number: u64,
    /// L1 block time recorded by the contract.
    pub block_time: u64,
    /// Segment start in state-vector coordinates.
    pub segment_start: u64,
    /// Segment length.
    pub segment_length: u64,
    /// L1 block the event log was emitted in; drives timeout bookkeeping.
    pub raw_block_number: u64,
}

/// `ChallengeCompleted` as the challenge loop consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeCompletedEvent {
    /// The staker that won.
    pub winner: Address,
    /// The staker that lost.
    pub loser: Address,
}

/// Async surface of one Challenge contract.
#[async_trait]
pub trait ChallengeClient: Send + Sync {
    /// Which staker must move next.
    async fn current_responder(&self) -> Result<Address, ContractError>;

    /// L1 blocks left on the current responder's clock.
    async fn current_responder_time_left(&self) -> Result<u64, ContractError>;

    /// The last recorded bisection, for crash recovery.
    async fn current_bisected(&self) -> Result<BisectedEvent, ContractError>;

    /// Posts a narrowed segment.
    async fn bisect_execution(
        &self,
        bisection: [B256; 3],
        challenge_index: u64,
        new_start: u64,
        new_length: u64,
        prev_start: u64,
        prev_length: u64,
    ) -> Result<(), ContractError>;

    /// Submits a one-step proof.
    async fn verify_one_step_proof(
        &self,
        ctx: &VerificationContext,
        proof: &OneStepProof,
        step_index: u64,
        prev_start: u64,
        prev_length: u64,
    ) -> Result<(), ContractError>;

    /// Claims the opponent's clock expired.
    async fn timeout(&self) -> Result<(), ContractError>;

    /// Forwards `Bisected` events into `sink` until shutdown.
    async fn subscribe_bisected(
        &self,
        sink: mpsc::Sender<BisectedEvent>,
    ) -> Result<(), ContractError>;

    /// Forwards `ChallengeCompleted` events into `sink` until shutdown.
    async fn subscribe_challenge_completed(
        &self,
        sink: mpsc::Sender<ChallengeCompletedEvent>,
    ) -> Result<(), ContractError>;

    /// Stops the session's event forwarding.
    fn shutdown(&self);
}

/// Creates [`ChallengeClient`] sessions for challenge contracts discovered
/// at runtime.
#[async_trait]
pub trait ChallengeManager: Send + Sync {
    /// Binds a session to the Challenge contract at `address`.
    async fn session(&self, address: Address) -> Result<Arc<dyn ChallengeClient>, ContractError>;
}

fn sol_context(ctx: &VerificationContext) -> IChallenge::VerificationContext {
    IChallenge::VerificationContext {
        coinbase: ctx.coinbase,
        timestamp: ctx.timestamp,
        number: ctx.block_number,
        origin: ctx.origin,
        transaction: IChallenge::EvmTransaction {
            nonce: ctx.transaction.nonce,
            gasPrice: ctx.transaction.gas_price,
            gas: ctx.transaction.gas,
            to: ctx.transaction.to,
            value: ctx.transaction.value,
            data: ctx.transaction.data.clone(),
            v: ctx.transaction.v,
            r: ctx.transaction.r,
            s: ctx.transaction.s,
        },
        inputRoot: ctx.input_root,
        txHash: ctx.tx_hash,
    }
}

/// Challenge session backed by the sol-generated bindings.
pub struct ChallengeContractClient {
    instance: IChallenge::IChallengeInstance<DynProvider>,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ChallengeContractClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeContractClient")
            .field("address", self.instance.address())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ChallengeClient for ChallengeContractClient {
    async fn current_responder(&self) -> Result<Address, ContractError> {
        self.instance
            .currentResponder()
            .call()
            .await
            .map_err(|e| ContractError::Call(format!("currentResponder: {e}")))
    }

    async fn current_responder_time_left(&self) -> Result<u64, ContractError> {
        let left = self
            .instance
            .currentResponderTimeLeft()
            .call()
            .await
            .map_err(|e| ContractError::Call(format!("currentResponderTimeLeft: {e}")))?;
        Ok(left.saturating_to())
    }

    async fn current_bisected(&self) -> Result<BisectedEvent, ContractError> {
        let r = self
            .instance
            .currentBisected()
            .call()
            .await
            .map_err(|e| ContractError::Call(format!("currentBisected: {e}")))?;
        Ok(BisectedEvent {
            start_state: r.startState,
            mid_state: r.midState,
            end_state: r.endState,
            block_number: r.blockNum.saturating_to(),
            block_time: r.blockTime.saturating_to(),
            segment_start: r.challengedSegmentStart.saturating_to(),
            segment_length: r.challengedSegmentLength.saturating_to(),
            raw_block_number: r.blockNum.saturating_to(),
        })
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
        let submit = || async {
            let pending = self
                .instance
                .bisectExecution(
                    bisection,
                    U256::from(challenge_index),
                    U256::from(new_start),
                    U256::from(new_length),
                    U256::from(prev_start),
                    U256::from(prev_length),
                )
                .send()
                .await
                .map_err(|e| ContractError::Submission(format!("bisectExecution: {e}")))?;
            let receipt = pending
                .get_receipt()
                .await
                .map_err(|e| ContractError::Submission(format!("bisectExecution: {e}")))?;
            if !receipt.status() {
                return Err(ContractError::Reverted("bisectExecution".into()));
            }
            Ok(())
        };
        submit
            .retry(self.retry.to_backoff_builder())
            .when(|e: &ContractError| !e.is_revert())
            .await
    }

    async fn verify_one_step_proof(
        &self,
        ctx: &VerificationContext,
        proof: &OneStepProof,
        step_index: u64,
        prev_start: u64,
        prev_length: u64,
    ) -> Result<(), ContractError> {
        let sol_ctx = sol_context(ctx);
        let submit = || async {
            let pending = self
                .instance
                .verifyOneStepProof(
                    sol_ctx.clone(),
                    proof.verifier as u8,
                    proof.encode(),
                    U256::from(step_index),
                    U256::from(prev_start),
                    U256::from(prev_length),
                )
                .send()
                .await
                .map_err(|e| ContractError::Submission(format!("verifyOneStepProof: {e}")))?;
            let receipt = pending
                .get_receipt()
                .await
                .map_err(|e| ContractError::Submission(format!("verifyOneStepProof: {e}")))?;
            if !receipt.status() {
                return Err(ContractError::Reverted("verifyOneStepProof".into()));
            }
            Ok(())
        };
        submit
            .retry(self.retry.to_backoff_builder())
            .when(|e: &ContractError| !e.is_revert())
            .await
    }

    async fn timeout(&self) -> Result<(), ContractError> {
        let pending = self
            .instance
            .timeout()
            .send()
            .await
            .map_err(|e| ContractError::Submission(format!("timeout: {e}")))?;
        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| ContractError::Submission(format!("timeout: {e}")))?;
        if !receipt.status() {
            return Err(ContractError::Reverted("timeout".into()));
        }
        Ok(())
    }

    async fn subscribe_bisected(
        &self,
        sink: mpsc::Sender<BisectedEvent>,
    ) -> Result<(), ContractError> {
        let poller = self
            .instance
            .Bisected_filter()
            .watch()
            .await
            .map_err(|e| ContractError::Subscription(format!("Bisected: {e}")))?;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut stream = poller.into_stream();
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    item = stream.next() => match item {
                        Some(Ok((ev, log))) => {
                            let ev = BisectedEvent {
                                start_state: ev.startState,
                                mid_state: ev.midState,
                                end_state: ev.endState,
                                block_number: ev.blockNum.saturating_to(),
                                block_time: ev.blockTime.saturating_to(),
                                segment_start: ev.challengedSegmentStart.saturating_to(),
                                segment_length: ev.challengedSegmentLength.saturating_to(),
                                raw_block_number: log.block_number.unwrap_or_default(),
                            };
                            if sink.send(ev).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(err)) => warn!(error = %err, "Bisected stream error"),
                        None => break,
                    },
                }
            }
        });
        Ok(())
    }

    async fn subscribe_challenge_completed(
        &self,
        sink: mpsc::Sender<ChallengeCompletedEvent>,
    ) -> Result<(), ContractError> {
        let poller = self
            .instance
            .ChallengeCompleted_filter()
            .watch()
            .await
            .map_err(|e| ContractError::Subscription(format!("ChallengeCompleted: {e}")))?;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut stream = poller.into_stream();
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    item = stream.next() => match item {
                        Some(Ok((ev, _log))) => {
                            let ev = ChallengeCompletedEvent {
                                winner: ev.winner,
                                loser: ev.loser,
                            };
                            if sink.send(ev).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(err)) => warn!(error = %err, "ChallengeCompleted stream error"),
                        None => break,
                    },
                }
            }
        });
        Ok(())
    }

    fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Session factory over the wallet-enabled L1 provider.
pub struct ChallengeContractManager {
    provider: DynProvider,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ChallengeContractManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeContractManager")
            .finish_non_exhaustive()
    }
}

impl ChallengeContractManager {
    /// Creates a manager reusing an existing provider connection.
    pub fn new(provider: DynProvider, retry: RetryConfig, cancel: CancellationToken) -> Self {
        Self {
            provider,
            retry,
            cancel,
        }
    }
}

#[async_trait]
impl ChallengeManager for ChallengeContractManager {
    async fn session(&self, address: Address) -> Result<Arc<dyn ChallengeClient>, ContractError> {
        Ok(Arc::new(ChallengeContractClient {
            instance: IChallenge::new(address, self.provider.clone()),
            retry: self.retry.clone(),
            // Child of the root token: a session dies with the process but
            // can also be shut down on its own at challenge completion.
            cancel: self.cancel.child_token(),
        }))
    }
}
