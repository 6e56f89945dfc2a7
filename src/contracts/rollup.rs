//! `Rollup` contract bindings: staking, assertions, and their events.

use alloy::network::EthereumWallet;
use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol;
use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use backon::Retryable;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use url::Url;

use crate::config::RetryConfig;
use crate::contracts::ContractError;

sol! {
    /// On-chain rollup contract: stake registry and assertion chain.
    #[sol(rpc)]
    interface IRollup {
        /// A new assertion was posted.
        event AssertionCreated(uint256 assertionID, address asserterAddr, bytes32 vmHash, uint256 inboxSize);
        /// An assertion was challenged; a Challenge contract was deployed.
        event AssertionChallenged(uint256 assertionID, address challengeAddr);

        /// Maps an operator address to its staker address.
        function registers(address operator) external view returns (address staker);

        /// Staker bookkeeping.
        function stakers(address staker) external view returns (
            bool isStaked,
            uint256 amountStaked,
            uint256 assertionID,
            address currentChallenge
        );

        /// Assertion bookkeeping.
        function assertions(uint256 assertionID) external view returns (
            bytes32 stateHash,
            uint256 inboxSize,
            uint256 parent
        );

        /// Stakers that lost a challenge and await cleanup.
        function zombies(uint256 index) external view returns (address stakerAddress, uint256 lastAssertionID);

        /// The rollup's view of the current challenge, if any.
        function challengeContext() external view returns (
            address defender,
            address challenger,
            bool completed
        );

        function isStaked(address staker) external view returns (bool);
        function stake(uint256 stakeAmount, address operator) external;
        function createAssertion(bytes32 vmHash, uint256 inboxSize) external;
        function advanceStake(uint256 assertionID) external;
        function challengeAssertion(address[2] calldata players, uint256[2] calldata assertionIDs) external returns (address);
    }
}

/// `AssertionCreated` as the loops consume it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionCreatedEvent {
    /// Id of the new assertion.
    pub assertion_id: U256,
    /// Address that posted it.
    pub asserter: Address,
    /// Claimed VM state commitment.
    pub vm_hash: B256,
    /// L2 block height committed to.
    pub inbox_size: U256,
}

/// `AssertionChallenged` as the loops consume it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionChallengedEvent {
    /// Id of the challenged assertion.
    pub assertion_id: U256,
    /// Address of the deployed Challenge contract.
    pub challenge_addr: Address,
}

/// Result of the `stakers` getter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakerStatus {
    /// Whether the address holds an active stake.
    pub is_staked: bool,
    /// Bonded amount.
    pub amount_staked: U256,
    /// Last assertion the staker is staked on.
    pub assertion_id: U256,
    /// Challenge contract the staker is engaged in, zero when idle.
    pub current_challenge: Address,
}

/// Result of the `assertions` getter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssertionState {
    /// Claimed VM state commitment.
    pub state_hash: B256,
    /// L2 block height committed to; zero marks a deleted assertion.
    pub inbox_size: U256,
    /// Parent assertion id.
    pub parent: U256,
}

/// Result of the `zombies` getter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Zombie {
    /// Staker address, zero when the slot is empty.
    pub staker_address: Address,
    /// Last assertion of the defeated staker.
    pub last_assertion_id: U256,
}

/// Result of the `challengeContext` getter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeContextState {
    /// Defending staker.
    pub defender: Address,
    /// Challenging staker.
    pub challenger: Address,
    /// Whether the challenge has completed.
    pub completed: bool,
}

/// Async surface of the rollup contract.
#[async_trait]
pub trait RollupClient: Send + Sync {
    /// Resolves an operator address to its staker address.
    async fn staker_address(&self, operator: Address) -> Result<Address, ContractError>;

    /// Reads a staker's status.
    async fn staker(&self, staker: Address) -> Result<StakerStatus, ContractError>;

    /// Reads an assertion.
    async fn assertion(&self, id: U256) -> Result<AssertionState, ContractError>;

    /// Reads a zombie slot.
    async fn zombie(&self, index: U256) -> Result<Zombie, ContractError>;

    /// Reads the rollup's challenge bookkeeping.
    async fn challenge_context(&self) -> Result<ChallengeContextState, ContractError>;

    /// Whether `staker` holds an active stake.
    async fn is_staked(&self, staker: Address) -> Result<bool, ContractError>;

    /// Bonds `amount` for `operator`.
    async fn stake(&self, amount: U256, operator: Address) -> Result<(), ContractError>;

    /// Posts a new assertion.
    async fn create_assertion(&self, vm_hash: B256, inbox_size: U256)
        -> Result<(), ContractError>;

    /// Moves our stake onto assertion `id`; returns the transaction fee in
    /// wei for metrics.
    async fn advance_stake(&self, id: U256) -> Result<u128, ContractError>;

    /// Opens a challenge between two assertions.
    async fn challenge_assertion(
        &self,
        players: [Address; 2],
        assertion_ids: [U256; 2],
    ) -> Result<(), ContractError>;

    /// Forwards `AssertionCreated` events into `sink` until shutdown.
    async fn subscribe_assertion_created(
        &self,
        sink: mpsc::Sender<AssertionCreatedEvent>,
    ) -> Result<(), ContractError>;

    /// Forwards `AssertionChallenged` events into `sink` until shutdown.
    async fn subscribe_assertion_challenged(
        &self,
        sink: mpsc::Sender<AssertionChallengedEvent>,
    ) -> Result<(), ContractError>;
}

/// Rollup client backed by the sol-generated bindings over a websocket
/// provider.
pub struct RollupContractClient {
    instance: IRollup::IRollupInstance<DynProvider>,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl std::fmt::Debug for RollupContractClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollupContractClient")
            .field("address", self.instance.address())
            .finish_non_exhaustive()
    }
}

impl RollupContractClient {
    /// Connects to the L1 endpoint and binds the rollup contract.
    pub async fn connect(
        endpoint: &Url,
        rollup: Address,
        signer: PrivateKeySigner,
        retry: RetryConfig,
        cancel: CancellationToken,
    ) -> Result<Self, ContractError> {
        let wallet = EthereumWallet::from(signer);
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .connect_ws(WsConnect::new(endpoint.as_str()))
            .await
            .map_err(|e| ContractError::Provider(e.to_string()))?
            .erased();
        Ok(Self {
            instance: IRollup::new(rollup, provider),
            retry,
            cancel,
        })
    }

    /// The provider the client was built on, for constructing sibling
    /// clients over the same connection.
    pub fn provider(&self) -> DynProvider {
        self.instance.provider().clone()
    }

    async fn confirm(
        &self,
        label: &str,
        pending: alloy::providers::PendingTransactionBuilder<alloy::network::Ethereum>,
    ) -> Result<u128, ContractError> {
        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| ContractError::Submission(format!("{label}: {e}")))?;
        if !receipt.status() {
            return Err(ContractError::Reverted(label.to_string()));
        }
        Ok(u128::from(receipt.gas_used) * receipt.effective_gas_price)
    }
}

#[async_trait]
impl RollupClient for RollupContractClient {
    async fn staker_address(&self, operator: Address) -> Result<Address, ContractError> {
        self.instance
            .registers(operator)
            .call()
            .await
            .map_err(|e| ContractError::Call(format!("registers: {e}")))
    }

    async fn staker(&self, staker: Address) -> Result<StakerStatus, ContractError> {
        let r = self
            .instance
            .stakers(staker)
            .call()
            .await
            .map_err(|e| ContractError::Call(format!("stakers: {e}")))?;
        Ok(StakerStatus {
            is_staked: r.isStaked,
            amount_staked: r.amountStaked,
            assertion_id: r.assertionID,
            current_challenge: r.currentChallenge,
        })
    }

    async fn assertion(&self, id: U256) -> Result<AssertionState, ContractError> {
        let r = self
            .instance
            .assertions(id)
            .call()
            .await
            .map_err(|e| ContractError::Call(format!("assertions({id}): {e}")))?;
        Ok(AssertionState {
            state_hash: r.stateHash,
            inbox_size: r.inboxSize,
            parent: r.parent,
        })
    }

    async fn zombie(&self, index: U256) -> Result<Zombie, ContractError> {
        let r = self
            .instance
            .zombies(index)
            .call()
            .await
            .map_err(|e| ContractError::Call(format!("zombies({index}): {e}")))?;
        Ok(Zombie {
            staker_address: r.stakerAddress,
            last_assertion_id: r.lastAssertionID,
        })
    }

    async fn challenge_context(&self) -> Result<ChallengeContextState, ContractError> {
        let r = self
            .instance
            .challengeContext()
            .call()
            .await
            .map_err(|e| ContractError::Call(format!("challengeContext: {e}")))?;
        Ok(ChallengeContextState {
            defender: r.defender,
            challenger: r.challenger,
            completed: r.completed,
        })
    }

    async fn is_staked(&self, staker: Address) -> Result<bool, ContractError> {
        self.instance
            .isStaked(staker)
            .call()
            .await
            .map_err(|e| ContractError::Call(format!("isStaked: {e}")))
    }

    async fn stake(&self, amount: U256, operator: Address) -> Result<(), ContractError> {
        let submit = || async {
            let pending = self
                .instance
                .stake(amount, operator)
                .send()
                .await
                .map_err(|e| ContractError::Submission(format!("stake: {e}")))?;
            self.confirm("stake", pending).await.map(drop)
        };
        submit
            .retry(self.retry.to_backoff_builder())
            .when(|e: &ContractError| !e.is_revert())
            .await
    }

    async fn create_assertion(
        &self,
        vm_hash: B256,
        inbox_size: U256,
    ) -> Result<(), ContractError> {
        let submit = || async {
            let pending = self
                .instance
                .createAssertion(vm_hash, inbox_size)
                .send()
                .await
                .map_err(|e| ContractError::Submission(format!("createAssertion: {e}")))?;
            self.confirm("createAssertion", pending).await.map(drop)
        };
        submit
            .retry(self.retry.to_backoff_builder())
            .when(|e: &ContractError| !e.is_revert())
            .await
    }

    async fn advance_stake(&self, id: U256) -> Result<u128, ContractError> {
        let submit = || async {
            let pending = self
                .instance
                .advanceStake(id)
                .send()
                .await
                .map_err(|e| ContractError::Submission(format!("advanceStake({id}): {e}")))?;
            self.confirm("advanceStake", pending).await
        };
        submit
            .retry(self.retry.to_backoff_builder())
            .when(|e: &ContractError| !e.is_revert())
            .await
    }

    async fn challenge_assertion(
        &self,
        players: [Address; 2],
        assertion_ids: [U256; 2],
    ) -> Result<(), ContractError> {
        let submit = || async {
            let pending = self
                .instance
                .challengeAssertion(players, assertion_ids)
                .send()
                .await
                .map_err(|e| ContractError::Submission(format!("challengeAssertion: {e}")))?;
            self.confirm("challengeAssertion", pending).await.map(drop)
        };
        submit
            .retry(self.retry.to_backoff_builder())
            .when(|e: &ContractError| !e.is_revert())
            .await
    }

    async fn subscribe_assertion_created(
        &self,
        sink: mpsc::Sender<AssertionCreatedEvent>,
    ) -> Result<(), ContractError> {
        let poller = self
            .instance
            .AssertionCreated_filter()
            .watch()
            .await
            .map_err(|e| ContractError::Subscription(format!("AssertionCreated: {e}")))?;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut stream = poller.into_stream();
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    item = stream.next() => match item {
                        Some(Ok((ev, _log))) => {
                            let ev = AssertionCreatedEvent {
                                assertion_id: ev.assertionID,
                                asserter: ev.asserterAddr,
                                vm_hash: ev.vmHash,
                                inbox_size: ev.inboxSize,
                            };
                            if sink.send(ev).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(err)) => {
                            warn!(error = %err, "AssertionCreated stream error");
                        }
                        None => break,
                    },
                }
            }
        });
        Ok(())
    }

    async fn subscribe_assertion_challenged(
        &self,
        sink: mpsc::Sender<AssertionChallengedEvent>,
    ) -> Result<(), ContractError> {
        let poller = self
            .instance
            .AssertionChallenged_filter()
            .watch()
            .await
            .map_err(|e| ContractError::Subscription(format!("AssertionChallenged: {e}")))?;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut stream = poller.into_stream();
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    item = stream.next() => match item {
                        Some(Ok((ev, _log))) => {
                            let ev = AssertionChallengedEvent {
                                assertion_id: ev.assertionID,
                                challenge_addr: ev.challengeAddr,
                            };
                            if sink.send(ev).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(err)) => {
                            warn!(error = %err, "AssertionChallenged stream error");
                        }
                        None => break,
                    },
                }
            }
        });
        Ok(())
    }
}
