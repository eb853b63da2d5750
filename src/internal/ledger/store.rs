use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use uuid::Uuid;

/// A stored value together with the commit sequence that last wrote it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub version: u64,
}

/// Read and write sets of one transaction, submitted atomically.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    /// Version observed for every key read; `None` means the key was absent.
    pub reads: BTreeMap<String, Option<u64>>,
    /// `None` deletes the key.
    pub writes: BTreeMap<String, Option<Vec<u8>>>,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Transaction conflict on key {key}: state changed since it was read, resubmit")]
    Conflict { key: String },
    #[error("Ledger storage error: {0}")]
    Storage(String),
    #[error("Invalid ledger record under {key}: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

/// Ordered key-value store with MVCC-validated atomic commits.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, LedgerError>;

    /// Half-open range `[start, end)`. An empty `end` is unbounded.
    async fn range(&self, start: &str, end: &str) -> Result<Vec<(String, Versioned)>, LedgerError>;

    /// Applies the batch if every read version still matches, returning the commit version.
    async fn commit(&self, batch: WriteBatch) -> Result<u64, LedgerError>;
}

#[derive(Default)]
struct MemoryState {
    entries: BTreeMap<String, Versioned>,
    sequence: u64,
}

/// In-process store used by tests and single-node deployments.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, LedgerError> {
        Ok(self.inner.read().await.entries.get(key).cloned())
    }

    async fn range(&self, start: &str, end: &str) -> Result<Vec<(String, Versioned)>, LedgerError> {
        let state = self.inner.read().await;
        let items = state
            .entries
            .range(start.to_string()..)
            .take_while(|(key, _)| end.is_empty() || key.as_str() < end)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        Ok(items)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<u64, LedgerError> {
        let mut state = self.inner.write().await;

        for (key, observed) in &batch.reads {
            let current = state.entries.get(key).map(|v| v.version);
            if current != *observed {
                return Err(LedgerError::Conflict { key: key.clone() });
            }
        }

        state.sequence += 1;
        let version = state.sequence;
        for (key, value) in batch.writes {
            match value {
                Some(value) => {
                    state.entries.insert(key, Versioned { value, version });
                }
                None => {
                    state.entries.remove(&key);
                }
            }
        }
        Ok(version)
    }
}

/// Strictly increasing transaction clock that never runs behind wall time.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    last: Arc<Mutex<DateTime<Utc>>>,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(DateTime::<Utc>::MIN_UTC)),
        }
    }

    pub fn tick(&self) -> DateTime<Utc> {
        let now = Utc::now();
        let mut last = match self.last.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = if now > *last {
            now
        } else {
            *last + Duration::microseconds(1)
        };
        *last = next;
        next
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry point for submitting transactions against a store.
#[derive(Clone)]
pub struct Ledger {
    store: Arc<dyn KvStore>,
    clock: MonotonicClock,
}

impl Ledger {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            clock: MonotonicClock::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn begin(&self, caller: &str) -> TxContext {
        TxContext {
            store: self.store.clone(),
            tx_id: Uuid::new_v4(),
            caller: caller.to_string(),
            timestamp: self.clock.tick(),
            batch: WriteBatch::default(),
        }
    }
}

/// Per-transaction view of the ledger. Reads are recorded for validation at commit.
pub struct TxContext {
    store: Arc<dyn KvStore>,
    tx_id: Uuid,
    caller: String,
    timestamp: DateTime<Utc>,
    batch: WriteBatch,
}

impl TxContext {
    pub fn caller_identity(&self) -> &str {
        &self.caller
    }

    pub fn tx_timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub async fn get_state(&mut self, key: &str) -> Result<Option<Vec<u8>>, LedgerError> {
        if let Some(pending) = self.batch.writes.get(key) {
            return Ok(pending.clone());
        }
        let current = self.store.get(key).await?;
        self.batch
            .reads
            .entry(key.to_string())
            .or_insert_with(|| current.as_ref().map(|v| v.version));
        Ok(current.map(|v| v.value))
    }

    pub fn put_state(&mut self, key: &str, value: Vec<u8>) {
        self.batch.writes.insert(key.to_string(), Some(value));
    }

    pub fn del_state(&mut self, key: &str) {
        self.batch.writes.insert(key.to_string(), None);
    }

    /// Scans `[start, end)` merged with this transaction's pending writes.
    pub async fn state_by_range(
        &mut self,
        start: &str,
        end: &str,
    ) -> Result<Vec<(String, Vec<u8>)>, LedgerError> {
        let mut merged: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for (key, versioned) in self.store.range(start, end).await? {
            self.batch
                .reads
                .entry(key.clone())
                .or_insert(Some(versioned.version));
            merged.insert(key, versioned.value);
        }

        let in_range = |key: &str| key >= start && (end.is_empty() || key < end);
        for (key, pending) in &self.batch.writes {
            if !in_range(key) {
                continue;
            }
            match pending {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    pub async fn get_json<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>, LedgerError> {
        match self.get_state(key).await? {
            Some(bytes) => decode(key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn put_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), LedgerError> {
        let bytes = serde_json::to_vec(value).map_err(|source| LedgerError::Codec {
            key: key.to_string(),
            source,
        })?;
        self.put_state(key, bytes);
        Ok(())
    }

    pub async fn scan_json<T: DeserializeOwned>(&mut self, prefix: &str) -> Result<Vec<T>, LedgerError> {
        let end = prefix_end(prefix);
        self.state_by_range(prefix, &end)
            .await?
            .iter()
            .map(|(key, bytes)| decode(key, bytes))
            .collect()
    }

    /// Submits the transaction. Read-only transactions commit trivially.
    pub async fn commit(self) -> Result<Option<u64>, LedgerError> {
        if self.batch.writes.is_empty() {
            return Ok(None);
        }
        let tx_id = self.tx_id;
        let version = self.store.commit(self.batch).await?;
        tracing::debug!(%tx_id, version, caller = %self.caller, "ledger transaction committed");
        Ok(Some(version))
    }
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, LedgerError> {
    serde_json::from_slice(bytes).map_err(|source| LedgerError::Codec {
        key: key.to_string(),
        source,
    })
}

/// Smallest key greater than every key starting with `prefix`.
pub fn prefix_end(prefix: &str) -> String {
    let mut bytes = prefix.as_bytes().to_vec();
    while let Some(last) = bytes.pop() {
        if last < 0x7f {
            bytes.push(last + 1);
            return String::from_utf8(bytes).unwrap_or_default();
        }
    }
    String::new()
}
