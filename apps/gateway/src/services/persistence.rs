//! Persistence Service client: durable chat history, follow graph, view counters.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use roomcast_common::SnowflakeGenerator;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::GatewayError;

/// A chat message accepted from a client, not yet stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewChatMessage {
    pub room_id: String,
    pub author_id: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
}

/// A stored chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub room_id: String,
    pub author_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewCount {
    pub post_id: String,
    pub views: u64,
}

#[async_trait]
pub trait PersistenceService: Send + Sync {
    async fn save_chat_message(&self, msg: NewChatMessage) -> Result<ChatMessage, GatewayError>;
    async fn get_followed_ids(&self, user_id: &str) -> Result<Vec<String>, GatewayError>;
    async fn flush_view_counts(&self, counts: &[ViewCount]) -> Result<(), GatewayError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct FollowingResponse {
    ids: Vec<String>,
}

#[derive(Serialize)]
struct FlushViewsRequest<'a> {
    counts: &'a [ViewCount],
}

pub struct HttpPersistenceService {
    base_url: String,
    http: reqwest::Client,
}

impl HttpPersistenceService {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl PersistenceService for HttpPersistenceService {
    async fn save_chat_message(&self, msg: NewChatMessage) -> Result<ChatMessage, GatewayError> {
        let url = format!("{}/internal/chat/{}/messages", self.base_url, msg.room_id);
        let saved = self
            .http
            .post(&url)
            .json(&msg)
            .send()
            .await?
            .error_for_status()?
            .json::<ChatMessage>()
            .await?;
        Ok(saved)
    }

    async fn get_followed_ids(&self, user_id: &str) -> Result<Vec<String>, GatewayError> {
        let url = format!("{}/internal/users/{}/following", self.base_url, user_id);
        let body = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<FollowingResponse>()
            .await?;
        Ok(body.ids)
    }

    async fn flush_view_counts(&self, counts: &[ViewCount]) -> Result<(), GatewayError> {
        let url = format!("{}/internal/posts/views", self.base_url);
        self.http
            .post(&url)
            .json(&FlushViewsRequest { counts })
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation (single-node dev / tests)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryState {
    messages: Vec<ChatMessage>,
    follows: HashMap<String, Vec<String>>,
    views: HashMap<String, u64>,
    fail_writes: bool,
}

/// Keeps everything in process memory. Writes can be switched to fail for testing.
pub struct MemoryPersistence {
    ids: SnowflakeGenerator,
    state: Mutex<MemoryState>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self {
            ids: SnowflakeGenerator::new(0),
            state: Mutex::new(MemoryState::default()),
        }
    }

    pub fn set_following(&self, user_id: &str, followed: &[&str]) {
        self.state.lock().follows.insert(
            user_id.to_string(),
            followed.iter().map(|s| s.to_string()).collect(),
        );
    }

    /// Make every subsequent write fail with an upstream error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    pub fn messages(&self, room_id: &str) -> Vec<ChatMessage> {
        self.state
            .lock()
            .messages
            .iter()
            .filter(|m| m.room_id == room_id)
            .cloned()
            .collect()
    }

    pub fn views(&self, post_id: &str) -> u64 {
        self.state.lock().views.get(post_id).copied().unwrap_or(0)
    }
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistenceService for MemoryPersistence {
    async fn save_chat_message(&self, msg: NewChatMessage) -> Result<ChatMessage, GatewayError> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(GatewayError::upstream("chat store unavailable"));
        }
        let saved = ChatMessage {
            id: self.ids.generate().to_string(),
            room_id: msg.room_id,
            author_id: msg.author_id,
            content: msg.content,
            reply_to_id: msg.reply_to_id,
            created_at: Utc::now(),
        };
        state.messages.push(saved.clone());
        Ok(saved)
    }

    async fn get_followed_ids(&self, user_id: &str) -> Result<Vec<String>, GatewayError> {
        Ok(self
            .state
            .lock()
            .follows
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn flush_view_counts(&self, counts: &[ViewCount]) -> Result<(), GatewayError> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(GatewayError::upstream("view counter store unavailable"));
        }
        for c in counts {
            *state.views.entry(c.post_id.clone()).or_default() += c.views;
        }
        Ok(())
    }
}
