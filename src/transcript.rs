use crate::error::ChatError;
use crate::request::ChatRequest;
use crate::store::{BlobStore, ChatIndex, ChatIndexRow};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub const ANONYMOUS_USER_ID: &str = "anonymous";
pub const TRANSCRIPT_CONTENT_TYPE: &str = "application/json";
pub const RECENT_CHATS_LIMIT: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Image metadata kept in a transcript. Payloads are never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMeta {
    pub mime_type: String,
    pub bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageMeta>,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    pub id: Uuid,
    pub user_id: String,
    pub model_id: String,
    pub created_at: String,
    pub turns: Vec<Turn>,
}

impl ChatRecord {
    pub fn blob_key(&self) -> String {
        blob_key(&self.id)
    }
}

pub fn blob_key(id: &Uuid) -> String {
    format!("chat-{id}.json")
}

pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// What is known about a request at acceptance time; completed into a [`ChatRecord`] once the
/// answer is available.
#[derive(Debug, Clone)]
pub struct PendingChat {
    pub id: Uuid,
    pub model_id: String,
    pub accepted_at: DateTime<Utc>,
    pub user_turn: Turn,
}

impl PendingChat {
    pub fn new(model_id: &str, req: &ChatRequest) -> Self {
        let accepted_at = Utc::now();
        Self {
            id: Uuid::new_v4(),
            model_id: model_id.to_string(),
            accepted_at,
            user_turn: Turn {
                role: Role::User,
                content: req.text.clone(),
                images: req
                    .images
                    .iter()
                    .map(|image| ImageMeta {
                        mime_type: image.mime_type.clone(),
                        bytes: image.decoded_len,
                    })
                    .collect(),
                timestamp: timestamp(accepted_at),
            },
        }
    }

    pub fn complete(self, answer: String) -> ChatRecord {
        ChatRecord {
            id: self.id,
            user_id: ANONYMOUS_USER_ID.to_string(),
            model_id: self.model_id,
            created_at: timestamp(self.accepted_at),
            turns: vec![
                self.user_turn,
                Turn {
                    role: Role::Assistant,
                    content: answer,
                    images: Vec::new(),
                    timestamp: timestamp(Utc::now()),
                },
            ],
        }
    }
}

/// Writes transcripts to the blob store and indexes them in the chats table.
#[derive(Clone)]
pub struct TranscriptPersister {
    blobs: Arc<dyn BlobStore>,
    index: Arc<dyn ChatIndex>,
}

impl TranscriptPersister {
    pub fn new(blobs: Arc<dyn BlobStore>, index: Arc<dyn ChatIndex>) -> Self {
        Self { blobs, index }
    }

    /// Blob first, then the index row. A failed index write leaves the blob in place.
    pub async fn persist(&self, record: &ChatRecord) -> Result<(), ChatError> {
        let key = record.blob_key();
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|err| ChatError::Storage(err.to_string()))?;
        self.blobs
            .put(&key, bytes, TRANSCRIPT_CONTENT_TYPE)
            .await
            .map_err(|err| ChatError::Storage(format!("blob write {key}: {err}")))?;
        self.index
            .insert(ChatIndexRow {
                id: record.id.to_string(),
                user_id: record.user_id.clone(),
                created_at: record.created_at.clone(),
                blob_key: key,
                model: record.model_id.clone(),
            })
            .await
            .map_err(|err| ChatError::Storage(format!("index write {}: {err}", record.id)))?;
        Ok(())
    }

    /// Persists on a detached task. Failures are logged and never reach the caller.
    pub fn spawn_persist(&self, record: ChatRecord) {
        let persister = self.clone();
        tokio::spawn(async move {
            match persister.persist(&record).await {
                Ok(()) => {
                    metrics::counter!("chatrouter_transcripts_total", "outcome" => "stored")
                        .increment(1);
                    tracing::debug!(chat_id = %record.id, "transcript persisted");
                }
                Err(err) => {
                    metrics::counter!("chatrouter_transcripts_total", "outcome" => "failed")
                        .increment(1);
                    tracing::error!(chat_id = %record.id, "transcript persist failed: {err}");
                }
            }
        });
    }

    pub async fn load(&self, id: &Uuid) -> Result<Option<ChatRecord>, ChatError> {
        let key = blob_key(id);
        let Some(bytes) = self.blobs.get(&key).await.map_err(ChatError::Storage)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| ChatError::Storage(format!("decode {key}: {err}")))
    }

    pub async fn recent(&self, limit: u32) -> Result<Vec<ChatIndexRow>, ChatError> {
        self.index.recent(limit).await.map_err(ChatError::Storage)
    }
}
