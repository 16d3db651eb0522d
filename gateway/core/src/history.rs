//! History Store
//!
//! Owns the canonical, ordered message sequence of every conversation.
//! Everything else (dispatch tasks, the CLI, subscribers) holds copies; the
//! only way to change what is stored is through this store.
//!
//! # Design Philosophy
//!
//! - **Single writer per conversation**: each conversation id has its own
//!   async mutex, so writes to one conversation are serialized while writes
//!   to different conversations proceed in parallel
//! - **Whole-record replace**: a mutation reads the conversation, changes it
//!   in memory and writes the whole record back. The file backend writes to a
//!   temporary file and renames it over the old one, so a crash leaves either
//!   the old or the new record, never half of one
//! - **Pluggable backends**: [`ConversationStorage`] hides where records
//!   live; [`FileStorage`] for real use, [`MemoryStorage`] for tests and
//!   ephemeral sessions
//!
//! ```text
//!   append / update_message / edit ──▶ lock(conv) ──▶ read ──▶ mutate ──▶ write
//!                                          │                                │
//!                                    other convs                   tmp file + rename
//!                                   not blocked
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::ids::{ConversationId, MessageId, ProviderId};
use crate::message::{now_ms, Message};

/// File extension of stored conversations
const RECORD_EXTENSION: &str = "json";

/// File-name prefix marking a hex-encoded conversation id
const ENCODED_PREFIX: &str = "x-";

/// One stored conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Conversation id
    pub id: ConversationId,
    /// Provider the conversation was started with (absent for fan-out)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<ProviderId>,
    /// Messages, oldest first
    pub messages: Vec<Message>,
    /// Last write (Unix ms)
    pub last_updated: u64,
}

impl Conversation {
    /// Empty conversation
    #[must_use]
    pub fn new(id: ConversationId, provider_id: Option<ProviderId>) -> Self {
        Self {
            id,
            provider_id,
            messages: Vec::new(),
            last_updated: now_ms(),
        }
    }

    fn position(&self, message_id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| m.id() == message_id)
    }
}

/// History failures
#[derive(Debug, Error)]
pub enum HistoryError {
    /// Backend I/O failed
    #[error("history I/O failed for {conversation}: {source}")]
    Io {
        /// Conversation being accessed
        conversation: ConversationId,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Stored record could not be decoded (or encoded)
    #[error("history record for {conversation} is corrupt: {source}")]
    Corrupt {
        /// Conversation being accessed
        conversation: ConversationId,
        /// Underlying error
        #[source]
        source: serde_json::Error,
    },

    /// No message with that id
    #[error("message {message} not found in {conversation}")]
    MessageNotFound {
        /// Conversation searched
        conversation: ConversationId,
        /// Missing id
        message: MessageId,
    },

    /// The message is still being produced by a dispatch
    #[error("message {message} in {conversation} is still in flight")]
    MessageInFlight {
        /// Conversation
        conversation: ConversationId,
        /// Message that cannot be edited yet
        message: MessageId,
    },
}

// ============================================================================
// Storage backends
// ============================================================================

/// Where conversation records live
#[async_trait]
pub trait ConversationStorage: Send + Sync {
    /// Read one conversation, `None` if it was never written
    async fn read(&self, id: &ConversationId) -> Result<Option<Conversation>, HistoryError>;

    /// Replace the stored record
    async fn write(&self, conversation: &Conversation) -> Result<(), HistoryError>;

    /// Ids of all stored conversations
    async fn list(&self) -> Result<Vec<ConversationId>, HistoryError>;
}

/// In-memory backend
#[derive(Debug, Default)]
pub struct MemoryStorage {
    records: RwLock<HashMap<ConversationId, Conversation>>,
}

impl MemoryStorage {
    /// Empty storage
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationStorage for MemoryStorage {
    async fn read(&self, id: &ConversationId) -> Result<Option<Conversation>, HistoryError> {
        Ok(self.records.read().get(id).cloned())
    }

    async fn write(&self, conversation: &Conversation) -> Result<(), HistoryError> {
        self.records
            .write()
            .insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ConversationId>, HistoryError> {
        Ok(self.records.read().keys().cloned().collect())
    }
}

/// One JSON file per conversation under a directory
#[derive(Clone, Debug)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Store records under `root` (created on first write)
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the records
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the record for `id`
    #[must_use]
    pub fn record_path(&self, id: &ConversationId) -> PathBuf {
        self.root.join(format!("{}.{RECORD_EXTENSION}", file_stem(id)))
    }
}

/// File-system safe stem for a conversation id
///
/// Ids made only of ASCII alphanumerics, `-` and `_` are used as-is; anything
/// else (and anything that could be mistaken for an encoded stem) is hex
/// encoded behind the `x-` prefix.
fn file_stem(id: &ConversationId) -> String {
    let raw = id.as_str();
    let safe = !raw.is_empty()
        && !raw.starts_with(ENCODED_PREFIX)
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if safe {
        raw.to_string()
    } else {
        format!("{ENCODED_PREFIX}{}", hex::encode(raw.as_bytes()))
    }
}

fn id_from_stem(stem: &str) -> Option<ConversationId> {
    match stem.strip_prefix(ENCODED_PREFIX) {
        Some(encoded) => {
            let bytes = hex::decode(encoded).ok()?;
            String::from_utf8(bytes).ok().map(ConversationId::new)
        }
        None => Some(ConversationId::new(stem)),
    }
}

#[async_trait]
impl ConversationStorage for FileStorage {
    async fn read(&self, id: &ConversationId) -> Result<Option<Conversation>, HistoryError> {
        let path = self.record_path(id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(HistoryError::Io {
                    conversation: id.clone(),
                    source,
                })
            }
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| HistoryError::Corrupt {
                conversation: id.clone(),
                source,
            })
    }

    async fn write(&self, conversation: &Conversation) -> Result<(), HistoryError> {
        let id = &conversation.id;
        let io_err = |source| HistoryError::Io {
            conversation: id.clone(),
            source,
        };

        let bytes = serde_json::to_vec_pretty(conversation).map_err(|source| {
            HistoryError::Corrupt {
                conversation: id.clone(),
                source,
            }
        })?;

        tokio::fs::create_dir_all(&self.root).await.map_err(io_err)?;

        let target = self.record_path(id);
        let tmp = self.root.join(format!(
            ".{}.{}.tmp",
            file_stem(id),
            uuid::Uuid::new_v4().simple()
        ));

        // Removes the temporary file on error and when this future is dropped
        let mut pending = TempFile::new(tmp);
        let written = async {
            let mut file = tokio::fs::File::create(pending.path()).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(pending.path(), &target).await
        }
        .await;
        written.map_err(io_err)?;
        pending.persisted();

        tracing::trace!(
            conversation = %id,
            messages = conversation.messages.len(),
            "Conversation written"
        );
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ConversationId>, HistoryError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(HistoryError::Io {
                    conversation: ConversationId::new(""),
                    source,
                })
            }
        };

        let mut ids = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    return Err(HistoryError::Io {
                        conversation: ConversationId::new(""),
                        source,
                    })
                }
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .filter(|s| !s.starts_with('.'))
                .and_then(id_from_stem)
            {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

/// Temporary record file, deleted on drop unless it was renamed into place
#[derive(Debug)]
struct TempFile {
    path: Option<PathBuf>,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    fn persisted(&mut self) {
        self.path = None;
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            // May not exist yet if creation never ran
            let _ = std::fs::remove_file(path);
        }
    }
}

// ============================================================================
// History Store
// ============================================================================

/// Canonical owner of conversation history
pub struct HistoryStore {
    storage: Arc<dyn ConversationStorage>,
    locks: DashMap<ConversationId, Arc<Mutex<()>>>,
}

impl HistoryStore {
    /// Store over any backend
    #[must_use]
    pub fn new(storage: Arc<dyn ConversationStorage>) -> Self {
        Self {
            storage,
            locks: DashMap::new(),
        }
    }

    /// Store that keeps everything in memory
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()))
    }

    /// Store with one JSON file per conversation under `dir`
    pub fn on_disk(dir: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FileStorage::new(dir)))
    }

    fn lock_for(&self, id: &ConversationId) -> Arc<Mutex<()>> {
        // Clone the Arc out so no map guard is held across an await
        self.locks
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Messages of a conversation, oldest first (empty if unknown)
    pub async fn load(&self, id: &ConversationId) -> Result<Vec<Message>, HistoryError> {
        Ok(self
            .storage
            .read(id)
            .await?
            .map(|c| c.messages)
            .unwrap_or_default())
    }

    /// Full conversation record
    pub async fn load_conversation(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, HistoryError> {
        self.storage.read(id).await
    }

    /// Ids of every stored conversation, sorted
    pub async fn conversations(&self) -> Result<Vec<ConversationId>, HistoryError> {
        let mut ids = self.storage.list().await?;
        ids.sort();
        Ok(ids)
    }

    /// Create the conversation if it does not exist yet
    pub async fn ensure_conversation(
        &self,
        id: &ConversationId,
        provider_id: Option<ProviderId>,
    ) -> Result<Conversation, HistoryError> {
        self.with_lock(id, async {
            if let Some(existing) = self.storage.read(id).await? {
                return Ok(existing);
            }
            let conversation = Conversation::new(id.clone(), provider_id);
            self.storage.write(&conversation).await?;
            tracing::debug!(conversation = %id, "Conversation created");
            Ok::<_, HistoryError>(conversation)
        })
        .await
    }

    /// Add a message at the end
    pub async fn append(&self, id: &ConversationId, message: Message) -> Result<(), HistoryError> {
        self.mutate(id, |conversation| {
            conversation.messages.push(message);
            Ok(())
        })
        .await
    }

    /// Replace the whole sequence
    pub async fn replace_all(
        &self,
        id: &ConversationId,
        messages: Vec<Message>,
    ) -> Result<(), HistoryError> {
        self.mutate(id, |conversation| {
            conversation.messages = messages;
            Ok(())
        })
        .await
    }

    /// Store the latest state of a message
    ///
    /// Replaces the message with the same id in place, or appends it when
    /// the conversation does not contain it yet.
    pub async fn update_message(
        &self,
        id: &ConversationId,
        message: &Message,
    ) -> Result<(), HistoryError> {
        self.mutate(id, |conversation| {
            match conversation.position(message.id()) {
                Some(idx) => conversation.messages[idx] = message.clone(),
                None => conversation.messages.push(message.clone()),
            }
            Ok(())
        })
        .await
    }

    /// Replace the content of a completed message (explicit user edit)
    pub async fn edit_message(
        &self,
        id: &ConversationId,
        message_id: &MessageId,
        content: impl Into<String>,
    ) -> Result<Message, HistoryError> {
        let content = content.into();
        self.mutate(id, |conversation| {
            let idx = conversation
                .position(message_id)
                .ok_or_else(|| HistoryError::MessageNotFound {
                    conversation: id.clone(),
                    message: message_id.clone(),
                })?;
            let current = &conversation.messages[idx];
            if !current.is_terminal() {
                return Err(HistoryError::MessageInFlight {
                    conversation: id.clone(),
                    message: message_id.clone(),
                });
            }
            let edited = current.edited(content);
            conversation.messages[idx] = edited.clone();
            Ok(edited)
        })
        .await
    }

    /// Remove a message, returning it
    pub async fn delete_message(
        &self,
        id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<Message, HistoryError> {
        self.mutate(id, |conversation| {
            let idx = conversation
                .position(message_id)
                .ok_or_else(|| HistoryError::MessageNotFound {
                    conversation: id.clone(),
                    message: message_id.clone(),
                })?;
            Ok(conversation.messages.remove(idx))
        })
        .await
    }

    /// Read-modify-write under the conversation's lock
    ///
    /// Nothing is written when `f` fails.
    async fn mutate<T, F>(&self, id: &ConversationId, f: F) -> Result<T, HistoryError>
    where
        F: FnOnce(&mut Conversation) -> Result<T, HistoryError>,
    {
        self.with_lock(id, async {
            let mut conversation = self
                .storage
                .read(id)
                .await?
                .unwrap_or_else(|| Conversation::new(id.clone(), None));
            let out = f(&mut conversation)?;
            conversation.last_updated = now_ms();
            self.storage.write(&conversation).await?;
            Ok::<_, HistoryError>(out)
        })
        .await
    }

    /// Run `work` holding the conversation's writer lock
    ///
    /// The lock entry is dropped again once nobody else holds or waits on it.
    async fn with_lock<T>(&self, id: &ConversationId, work: impl Future<Output = T>) -> T {
        let lock = self.lock_for(id);
        let out = {
            let _guard = lock.lock().await;
            work.await
        };
        drop(lock);
        self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
        out
    }
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore")
            .field("locked_conversations", &self.locks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::message::{MessageEvent, MessageStatus};
    use pretty_assertions::assert_eq;

    fn completed(provider: &str, text: &str) -> Message {
        let mut msg = Message::assistant(provider.into());
        msg.apply(MessageEvent::DispatchStarted).unwrap();
        msg.apply(MessageEvent::ContentDelta(text.into())).unwrap();
        msg.apply(MessageEvent::StreamComplete).unwrap();
        msg
    }

    fn sample_history() -> Vec<Message> {
        let mut failed = Message::assistant("anthropic".into());
        failed
            .apply(MessageEvent::Failed(GatewayError::non_success(
                &"anthropic".into(),
                503,
                "overloaded",
            )))
            .unwrap();
        vec![
            Message::user("Explain \"quotes\", émoji 🚀 and\nnewlines"),
            completed("openai", "Sure:\n\t- item"),
            failed,
        ]
    }

    #[tokio::test]
    async fn test_unknown_conversation_is_empty() {
        let store = HistoryStore::in_memory();
        assert!(store.load(&"nope".into()).await.unwrap().is_empty());
        assert!(store.load_conversation(&"nope".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_round_trip_is_exact() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::on_disk(dir.path());
        let id = ConversationId::new("chat-1");

        let history = sample_history();
        store.replace_all(&id, history.clone()).await.unwrap();
        let first = store.load(&id).await.unwrap();
        assert_eq!(first, history);

        store.replace_all(&id, first.clone()).await.unwrap();
        let second = store.load(&id).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(second[2].status(), MessageStatus::Failed);
        assert_eq!(second[2].error_detail().unwrap().status, Some(503));
    }

    #[tokio::test]
    async fn test_update_message_keeps_position() {
        let store = HistoryStore::in_memory();
        let id = ConversationId::new("c");

        let mut reply = Message::assistant("openai".into());
        store.append(&id, Message::user("q")).await.unwrap();
        store.append(&id, reply.clone()).await.unwrap();
        store.append(&id, Message::user("q2")).await.unwrap();

        reply.apply(MessageEvent::DispatchStarted).unwrap();
        reply.apply(MessageEvent::FullResponse("answer".into())).unwrap();
        store.update_message(&id, &reply).await.unwrap();

        let messages = store.load(&id).await.unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].content(), "answer");
        assert_eq!(messages[1].status(), MessageStatus::Sent);

        // unknown id is appended
        let extra = completed("gemini", "late");
        store.update_message(&id, &extra).await.unwrap();
        assert_eq!(store.load(&id).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_edit_and_delete() {
        let store = HistoryStore::in_memory();
        let id = ConversationId::new("c");
        let user = Message::user("typo");
        let pending = Message::assistant("openai".into());
        store.append(&id, user.clone()).await.unwrap();
        store.append(&id, pending.clone()).await.unwrap();

        let edited = store.edit_message(&id, user.id(), "fixed").await.unwrap();
        assert_eq!(edited.content(), "fixed");
        assert_eq!(edited.id(), user.id());

        let err = store.edit_message(&id, pending.id(), "x").await.unwrap_err();
        assert!(matches!(err, HistoryError::MessageInFlight { .. }));

        let removed = store.delete_message(&id, pending.id()).await.unwrap();
        assert_eq!(removed.id(), pending.id());
        let err = store.delete_message(&id, pending.id()).await.unwrap_err();
        assert!(matches!(err, HistoryError::MessageNotFound { .. }));

        let messages = store.load(&id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content(), "fixed");
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(HistoryStore::on_disk(dir.path()));
        let id = ConversationId::new("busy");

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                store.append(&id, Message::user(format!("m{i}"))).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let messages = store.load(&id).await.unwrap();
        assert_eq!(messages.len(), 16);
        assert!(store.locks.is_empty(), "idle lock entries are released");
    }

    #[tokio::test]
    async fn test_unsafe_ids_are_encoded() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let store = HistoryStore::new(Arc::new(storage.clone()));

        let ids = [
            ConversationId::new("plain_id-1"),
            ConversationId::new("../escape/attempt"),
            ConversationId::new("x-6162"),
        ];
        for id in &ids {
            store.ensure_conversation(id, None).await.unwrap();
            let path = storage.record_path(id);
            assert_eq!(path.parent(), Some(dir.path()));
        }
        assert_ne!(storage.record_path(&ids[2]), dir.path().join("x-6162.json"));

        let mut expected = ids.to_vec();
        expected.sort();
        assert_eq!(store.conversations().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_ensure_conversation_is_idempotent() {
        let store = HistoryStore::in_memory();
        let id = ConversationId::new("c");
        let created = store
            .ensure_conversation(&id, Some("openai".into()))
            .await
            .unwrap();
        assert_eq!(created.provider_id, Some("openai".into()));

        store.append(&id, Message::user("hi")).await.unwrap();
        let again = store.ensure_conversation(&id, None).await.unwrap();
        assert_eq!(again.provider_id, Some("openai".into()));
        assert_eq!(again.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path());
        let id = ConversationId::new("broken");
        tokio::fs::write(storage.record_path(&id), b"{not json")
            .await
            .unwrap();

        let store = HistoryStore::new(Arc::new(storage));
        let err = store.load(&id).await.unwrap_err();
        assert!(matches!(err, HistoryError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::on_disk(dir.path());
        let id = ConversationId::new("c");
        for i in 0..3 {
            store.append(&id, Message::user(format!("{i}"))).await.unwrap();
        }

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["c.json".to_string()]);
    }

    #[test]
    fn test_temp_file_removed_unless_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".c.1234.tmp");

        std::fs::write(&path, b"{\"partial").unwrap();
        drop(TempFile::new(path.clone()));
        assert!(!path.exists());

        std::fs::write(&path, b"{}").unwrap();
        let mut kept = TempFile::new(path.clone());
        kept.persisted();
        drop(kept);
        assert!(path.exists());

        // Never created: dropping is a no-op
        drop(TempFile::new(dir.path().join(".missing.tmp")));
    }
}
