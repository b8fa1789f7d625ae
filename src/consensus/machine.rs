// State machine contract and the key-value reference implementation
//
// The engine applies committed batches in phase order, exactly once per
// command. Implementations must be deterministic: the same batch sequence
// produces the same digest on every replica.

use crate::consensus::types::{Batch, Command};
use crate::error::{ClusterError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Deterministic application of committed command batches, plus the
/// snapshot pair used for state transfer.
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// Apply one committed batch. Called in phase order, once per batch.
    async fn apply(&self, batch: &Batch) -> Result<()>;

    /// Serialize the full application state.
    async fn snapshot(&self) -> Result<Vec<u8>>;

    /// Replace state with a snapshot. An empty snapshot resets the machine
    /// to its initial state.
    async fn restore(&self, snapshot: &[u8]) -> Result<()>;

    /// Deterministic digest of the current state.
    async fn digest(&self) -> [u8; 32];
}

/// Commands understood by the reference key-value machine.
#[derive(
    Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum KvCommand {
    Put { key: String, value: String },
    Remove { key: String },
}

impl KvCommand {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        KvCommand::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn remove(key: impl Into<String>) -> Self {
        KvCommand::Remove { key: key.into() }
    }

    pub fn encode(&self) -> Result<Command> {
        Ok(Command::new(bincode::encode_to_vec(
            self,
            bincode::config::standard(),
        )?))
    }

    pub fn decode(command: &Command) -> Result<KvCommand> {
        let (decoded, _) =
            bincode::decode_from_slice(command.as_bytes(), bincode::config::standard())?;
        Ok(decoded)
    }
}

/// In-memory ordered key-value store. The reference state machine used by
/// the integration tests and the crate examples.
#[derive(Default)]
pub struct KvStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.entries.read().await.contains_key(key)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl StateMachine for KvStore {
    async fn apply(&self, batch: &Batch) -> Result<()> {
        let mut entries = self.entries.write().await;
        for command in &batch.commands {
            match KvCommand::decode(command)? {
                KvCommand::Put { key, value } => {
                    entries.insert(key, value);
                }
                KvCommand::Remove { key } => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn snapshot(&self) -> Result<Vec<u8>> {
        let entries = self.entries.read().await;
        Ok(bincode::encode_to_vec(
            &*entries,
            bincode::config::standard(),
        )?)
    }

    async fn restore(&self, snapshot: &[u8]) -> Result<()> {
        let mut entries = self.entries.write().await;
        if snapshot.is_empty() {
            entries.clear();
            return Ok(());
        }
        let (decoded, _): (BTreeMap<String, String>, _) =
            bincode::decode_from_slice(snapshot, bincode::config::standard())
                .map_err(|e| ClusterError::Serialization(e.to_string()))?;
        *entries = decoded;
        Ok(())
    }

    async fn digest(&self) -> [u8; 32] {
        let entries = self.entries.read().await;
        let mut hasher = Sha256::new();
        for (key, value) in entries.iter() {
            hasher.update((key.len() as u32).to_be_bytes());
            hasher.update(key.as_bytes());
            hasher.update((value.len() as u32).to_be_bytes());
            hasher.update(value.as_bytes());
        }
        hasher.finalize().into()
    }
}
