//! Conversation state storage.
//!
//! [`InMemoryStore`] is the default. [`JsonFileStore`] keeps a copy on disk so
//! conversations survive restarts. Anything else plugs in by implementing
//! [`ConversationStore`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::ConversationKey;
use crate::error::StoreError;
use crate::transition::State;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// The stored state of one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    /// Current state.
    pub state: State,
    /// Changes every time the conversation is (re)started.
    pub generation: u64,
    /// Milliseconds since the Unix epoch of the last activity.
    pub updated_at_ms: u64,
}

/// Load/save contract for conversation state.
///
/// Calls for one key are always made while the conversation holds that key's
/// lock, so implementations only need to be safe across different keys.
#[async_trait]
pub trait ConversationStore: Send + Sync + 'static {
    async fn load(
        &self,
        conversation: &str,
        key: &ConversationKey,
    ) -> StoreResult<Option<ConversationRecord>>;

    async fn save(
        &self,
        conversation: &str,
        key: &ConversationKey,
        record: &ConversationRecord,
    ) -> StoreResult<()>;

    async fn remove(&self, conversation: &str, key: &ConversationKey) -> StoreResult<()>;

    /// Every stored record of one conversation, used to re-arm idle timers
    /// after a restart.
    async fn list(&self, conversation: &str)
    -> StoreResult<Vec<(ConversationKey, ConversationRecord)>>;
}

type RecordKey = (String, ConversationKey);

// =============================================================================
// InMemoryStore
// =============================================================================

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: DashMap<RecordKey, ConversationRecord>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of active conversations across all handlers.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn load(
        &self,
        conversation: &str,
        key: &ConversationKey,
    ) -> StoreResult<Option<ConversationRecord>> {
        Ok(self
            .records
            .get(&(conversation.to_string(), *key))
            .map(|r| r.clone()))
    }

    async fn save(
        &self,
        conversation: &str,
        key: &ConversationKey,
        record: &ConversationRecord,
    ) -> StoreResult<()> {
        self.records
            .insert((conversation.to_string(), *key), record.clone());
        Ok(())
    }

    async fn remove(&self, conversation: &str, key: &ConversationKey) -> StoreResult<()> {
        self.records.remove(&(conversation.to_string(), *key));
        Ok(())
    }

    async fn list(
        &self,
        conversation: &str,
    ) -> StoreResult<Vec<(ConversationKey, ConversationRecord)>> {
        Ok(self
            .records
            .iter()
            .filter(|entry| entry.key().0 == conversation)
            .map(|entry| (entry.key().1, entry.value().clone()))
            .collect())
    }
}

// =============================================================================
// JsonFileStore
// =============================================================================

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    conversation: String,
    key: ConversationKey,
    record: ConversationRecord,
}

/// A store that writes every change through to a JSON file.
///
/// The whole file is rewritten on each change, via a temporary file and a
/// rename.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    records: Mutex<HashMap<RecordKey, ConversationRecord>>,
}

impl JsonFileStore {
    /// Opens a store, loading existing records if the file exists.
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) if bytes.is_empty() => HashMap::new(),
            Ok(bytes) => {
                let entries: Vec<StoredEntry> = serde_json::from_slice(&bytes)?;
                entries
                    .into_iter()
                    .map(|e| ((e.conversation, e.key), e.record))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), records = records.len(), "Opened conversation store");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self, records: &HashMap<RecordKey, ConversationRecord>) -> StoreResult<()> {
        let mut entries: Vec<StoredEntry> = records
            .iter()
            .map(|((conversation, key), record)| StoredEntry {
                conversation: conversation.clone(),
                key: *key,
                record: record.clone(),
            })
            .collect();
        entries.sort_by(|a, b| (&a.conversation, a.key).cmp(&(&b.conversation, b.key)));

        let bytes = serde_json::to_vec_pretty(&entries)?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for JsonFileStore {
    async fn load(
        &self,
        conversation: &str,
        key: &ConversationKey,
    ) -> StoreResult<Option<ConversationRecord>> {
        let records = self.records.lock().await;
        Ok(records.get(&(conversation.to_string(), *key)).cloned())
    }

    async fn save(
        &self,
        conversation: &str,
        key: &ConversationKey,
        record: &ConversationRecord,
    ) -> StoreResult<()> {
        let mut records = self.records.lock().await;
        records.insert((conversation.to_string(), *key), record.clone());
        self.flush(&records).await
    }

    async fn remove(&self, conversation: &str, key: &ConversationKey) -> StoreResult<()> {
        let mut records = self.records.lock().await;
        if records.remove(&(conversation.to_string(), *key)).is_some() {
            self.flush(&records).await?;
        }
        Ok(())
    }

    async fn list(
        &self,
        conversation: &str,
    ) -> StoreResult<Vec<(ConversationKey, ConversationRecord)>> {
        let records = self.records.lock().await;
        Ok(records
            .iter()
            .filter(|((name, _), _)| name == conversation)
            .map(|((_, key), record)| (*key, record.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(state: &str) -> ConversationRecord {
        ConversationRecord {
            state: State::new(state),
            generation: 1,
            updated_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_in_memory_separates_conversations() {
        let store = InMemoryStore::new();
        let key = ConversationKey::new(Some(1), Some(2));
        store.save("a", &key, &record("X")).await.unwrap();

        assert_eq!(store.load("a", &key).await.unwrap(), Some(record("X")));
        assert_eq!(store.load("b", &key).await.unwrap(), None);

        let other = ConversationKey::new(Some(1), Some(3));
        store.save("a", &other, &record("Y")).await.unwrap();
        store.save("b", &key, &record("Z")).await.unwrap();
        let mut listed = store.list("a").await.unwrap();
        listed.sort_by_key(|(key, _)| *key);
        assert_eq!(listed, vec![(key, record("X")), (other, record("Y"))]);

        store.remove("a", &key).await.unwrap();
        store.remove("a", &other).await.unwrap();
        store.remove("b", &key).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_json_file_survives_reopen() {
        let path = std::env::temp_dir().join(format!(
            "courier-store-{}-{}.json",
            std::process::id(),
            line!()
        ));
        let key = ConversationKey::new(Some(-5), None);

        let store = JsonFileStore::open(&path).await.unwrap();
        store.save("signup", &key, &record("NAME")).await.unwrap();
        drop(store);

        let reopened = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(
            reopened.load("signup", &key).await.unwrap(),
            Some(record("NAME"))
        );
        assert_eq!(
            reopened.list("signup").await.unwrap(),
            vec![(key, record("NAME"))]
        );
        assert!(reopened.list("other").await.unwrap().is_empty());
        reopened.remove("signup", &key).await.unwrap();

        let empty = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(empty.load("signup", &key).await.unwrap(), None);
        let _ = std::fs::remove_file(&path);
    }
}
