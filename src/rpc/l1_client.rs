//! L1 chain client: head subscription and account queries.

use alloy::providers::{DynProvider, Provider, ProviderBuilder, WsConnect};
use alloy_primitives::{Address, B256, U256};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use url::Url;

use super::error::{RpcError, RpcResult};

/// A new L1 head as the challenge loop consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L1Head {
    /// Block number.
    pub number: u64,
    /// Block hash.
    pub hash: B256,
    /// Block timestamp.
    pub timestamp: u64,
}

/// Read surface of the L1 chain.
#[async_trait]
pub trait L1Client: Send + Sync {
    /// Latest L1 block number.
    async fn block_number(&self) -> RpcResult<u64>;

    /// Balance of `address` at the latest block.
    async fn balance(&self, address: Address) -> RpcResult<U256>;

    /// Forwards new-head notifications into `sink` until shutdown.
    async fn subscribe_new_heads(&self, sink: mpsc::Sender<L1Head>) -> RpcResult<()>;
}

/// Websocket-backed L1 client.
pub struct L1ClientImpl {
    provider: DynProvider,
    cancel: CancellationToken,
}

impl std::fmt::Debug for L1ClientImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("L1ClientImpl").finish_non_exhaustive()
    }
}

impl L1ClientImpl {
    /// Connects to the L1 websocket endpoint.
    pub async fn connect(endpoint: &Url, cancel: CancellationToken) -> RpcResult<Self> {
        let provider = ProviderBuilder::new()
            .connect_ws(WsConnect::new(endpoint.as_str()))
            .await
            .map_err(|e| RpcError::Connection(e.to_string()))?
            .erased();
        Ok(Self { provider, cancel })
    }

    /// Wraps an existing provider connection.
    pub fn from_provider(provider: DynProvider, cancel: CancellationToken) -> Self {
        Self { provider, cancel }
    }
}

#[async_trait]
impl L1Client for L1ClientImpl {
    async fn block_number(&self) -> RpcResult<u64> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| RpcError::Request(e.to_string()))
    }

    async fn balance(&self, address: Address) -> RpcResult<U256> {
        self.provider
            .get_balance(address)
            .await
            .map_err(|e| RpcError::Request(e.to_string()))
    }

    async fn subscribe_new_heads(&self, sink: mpsc::Sender<L1Head>) -> RpcResult<()> {
        let subscription = self
            .provider
            .subscribe_blocks()
            .await
            .map_err(|e| RpcError::Subscription(e.to_string()))?;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut stream = subscription.into_stream();
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    header = stream.next() => match header {
                        Some(header) => {
                            let head = L1Head {
                                number: header.number,
                                hash: header.hash,
                                timestamp: header.timestamp,
                            };
                            if sink.send(head).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            warn!("L1 head subscription closed");
                            break;
                        }
                    },
                }
            }
        });
        Ok(())
    }
}
