//! Durable challenge context.
//!
//! A single RLP-encoded blob under a well-known key in the chain's key-value
//! store. Written exactly when the validator decides to challenge, deleted
//! when the challenge completes on-chain; re-reading it at startup is the
//! whole crash-recovery mechanism.

use std::sync::Arc;

use alloy_primitives::{B256, U256};
use alloy_rlp::{Decodable, Encodable, RlpDecodable, RlpEncodable};
use thiserror::Error;

use crate::backend::{KeyValueStore, KvError};
use crate::constants::CHALLENGE_CTX_KEY;

/// Errors of the challenge store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying key-value store failure.
    #[error(transparent)]
    Kv(#[from] KvError),

    /// The persisted blob does not decode.
    #[error("corrupt challenge context: {0}")]
    Decode(alloy_rlp::Error),
}

/// An L1 assertion as the validator tracks it.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Assertion {
    /// On-chain assertion id.
    pub id: U256,
    /// Claimed VM state commitment.
    pub vm_hash: B256,
    /// L2 block height the assertion commits to.
    pub inbox_size: U256,
    /// Parent assertion id.
    pub parent: U256,
}

/// The persisted description of an in-flight challenge.
///
/// Both assertions share parent and inbox size and disagree on `vm_hash`.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct ChallengeContext {
    /// The assertion we dispute.
    pub opponent_assertion: Assertion,
    /// The assertion we will post in its place.
    pub our_assertion: Assertion,
}

/// Accessor for the single persisted challenge context.
#[derive(Clone)]
pub struct ChallengeStore {
    db: Arc<dyn KeyValueStore>,
}

impl std::fmt::Debug for ChallengeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChallengeStore").finish_non_exhaustive()
    }
}

impl ChallengeStore {
    /// Wraps the chain's key-value store.
    pub fn new(db: Arc<dyn KeyValueStore>) -> Self {
        Self { db }
    }

    /// Reads the persisted context, retrying transient store failures with
    /// a bounded backoff. A corrupt blob is reported immediately.
    pub async fn read_with_retry(
        &self,
        attempts: usize,
    ) -> Result<Option<ChallengeContext>, StoreError> {
        for _ in 1..attempts {
            match self.read() {
                Ok(ctx) => return Ok(ctx),
                Err(err @ StoreError::Decode(_)) => return Err(err),
                Err(_) => tokio::time::sleep(crate::constants::STORE_RETRY_DELAY).await,
            }
        }
        self.read()
    }

    /// Reads the persisted context, if a challenge is in flight.
    pub fn read(&self) -> Result<Option<ChallengeContext>, StoreError> {
        match self.db.get(CHALLENGE_CTX_KEY)? {
            Some(bytes) => {
                let ctx = ChallengeContext::decode(&mut bytes.as_slice())
                    .map_err(StoreError::Decode)?;
                Ok(Some(ctx))
            }
            None => Ok(None),
        }
    }

    /// Persists the context of a newly opened challenge.
    pub fn write(&self, ctx: &ChallengeContext) -> Result<(), StoreError> {
        let mut buf = Vec::new();
        ctx.encode(&mut buf);
        self.db.put(CHALLENGE_CTX_KEY, &buf)?;
        Ok(())
    }

    /// Deletes the context once the challenge completed.
    pub fn clear(&self) -> Result<(), StoreError> {
        self.db.delete(CHALLENGE_CTX_KEY)?;
        Ok(())
    }

    /// Whether a context is currently persisted.
    pub fn exists(&self) -> Result<bool, StoreError> {
        Ok(self.db.get(CHALLENGE_CTX_KEY)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryKv;

    fn context() -> ChallengeContext {
        ChallengeContext {
            opponent_assertion: Assertion {
                id: U256::from(3),
                vm_hash: B256::repeat_byte(0xaa),
                inbox_size: U256::from(40),
                parent: U256::from(2),
            },
            our_assertion: Assertion {
                id: U256::ZERO,
                vm_hash: B256::repeat_byte(0xbb),
                inbox_size: U256::from(40),
                parent: U256::from(2),
            },
        }
    }

    #[test]
    fn round_trip_is_exact() {
        let store = ChallengeStore::new(Arc::new(MemoryKv::default()));
        let ctx = context();
        store.write(&ctx).unwrap();
        assert_eq!(store.read().unwrap(), Some(ctx));
    }

    #[test]
    fn clear_removes_the_key() {
        let store = ChallengeStore::new(Arc::new(MemoryKv::default()));
        store.write(&context()).unwrap();
        assert!(store.exists().unwrap());
        store.clear().unwrap();
        assert!(!store.exists().unwrap());
        assert_eq!(store.read().unwrap(), None);
    }

    #[test]
    fn clearing_missing_key_is_fine() {
        let store = ChallengeStore::new(Arc::new(MemoryKv::default()));
        store.clear().unwrap();
        assert_eq!(store.read().unwrap(), None);
    }

    #[test]
    fn corrupt_blob_is_reported() {
        let kv = Arc::new(MemoryKv::default());
        kv.put(CHALLENGE_CTX_KEY, b"junk").unwrap();
        let store = ChallengeStore::new(kv);
        assert!(matches!(store.read(), Err(StoreError::Decode(_))));
    }

    /// Store that fails a fixed number of reads before recovering.
    struct FlakyKv {
        inner: MemoryKv,
        failures: std::sync::atomic::AtomicUsize,
    }

    impl KeyValueStore for FlakyKv {
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvError> {
            use std::sync::atomic::Ordering;
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(KvError("transient".into()));
            }
            self.inner.get(key)
        }
        fn put(&self, key: &[u8], value: &[u8]) -> Result<(), KvError> {
            self.inner.put(key, value)
        }
        fn delete(&self, key: &[u8]) -> Result<(), KvError> {
            self.inner.delete(key)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn read_retries_transient_failures() {
        let kv = Arc::new(FlakyKv {
            inner: MemoryKv::default(),
            failures: std::sync::atomic::AtomicUsize::new(2),
        });
        let store = ChallengeStore::new(Arc::clone(&kv) as Arc<dyn KeyValueStore>);
        store.write(&context()).unwrap();
        kv.failures
            .store(2, std::sync::atomic::Ordering::SeqCst);

        let ctx = store.read_with_retry(3).await.unwrap();
        assert_eq!(ctx, Some(context()));
    }

    #[tokio::test(start_paused = true)]
    async fn read_retry_gives_up_after_attempts() {
        let kv = Arc::new(FlakyKv {
            inner: MemoryKv::default(),
            failures: std::sync::atomic::AtomicUsize::new(10),
        });
        let store = ChallengeStore::new(kv);
        assert!(matches!(
            store.read_with_retry(3).await,
            Err(StoreError::Kv(_))
        ));
    }
}
