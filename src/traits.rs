use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::interaction::context::GoalContext;
use crate::interaction::intent::Intent;
use crate::types::{Channel, Conversation, FriendshipId, MessageId, UserMessage};

/// Role of a chat message sent to the language model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
}

/// A single prompt message for the language model.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Sampling options per LLM call. The classifier runs cold (temperature 0);
/// response generation runs warmer.
#[derive(Debug, Clone)]
pub struct ModelOptions {
    pub model: String,
    pub temperature: f32,
    pub top_p: Option<f32>,
}

impl ModelOptions {
    pub fn deterministic(model: &str) -> Self {
        Self {
            model: model.to_string(),
            temperature: 0.0,
            top_p: None,
        }
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }
}

/// Language model collaborator. Both methods return `None` on any failure
/// (network, provider error, empty answer) — callers treat that as "could not
/// classify/extract" and degrade; nothing here is allowed to bubble an error
/// into the orchestration loop.
///
/// `timezone` is the friend's IANA timezone name and `reference_time` the
/// moment their message arrived; both are handed to the model as context so
/// relative dates resolve correctly.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Prompt expecting a JSON answer. The provider strips code fences and
    /// surrounding prose where it can, but callers still parse defensively.
    async fn prompt_for_json(
        &self,
        messages: &[ChatMessage],
        options: &ModelOptions,
        timezone: &str,
        reference_time: DateTime<Utc>,
    ) -> Option<String>;

    /// Prompt expecting free text.
    async fn prompt_for_text(
        &self,
        messages: &[ChatMessage],
        options: &ModelOptions,
        timezone: &str,
        reference_time: DateTime<Utc>,
    ) -> Option<String>;
}

/// Persistence for per-friendship goal contexts.
///
/// Last-write-wins, no versioning. Two concurrent messages for the same
/// friendship can race on load/save; the signal receive loop processes one
/// message at a time per process, so this only matters across processes and
/// is accepted rather than locked against.
#[async_trait]
pub trait GoalContextRepository: Send + Sync {
    async fn load_context(&self, friendship_id: &FriendshipId) -> anyhow::Result<Option<GoalContext>>;
    async fn save_context(&self, friendship_id: &FriendshipId, context: &GoalContext) -> anyhow::Result<()>;
}

/// Read-only view of friendship settings the core needs.
#[async_trait]
pub trait FriendshipLedger: Send + Sync {
    /// The friend's configured IANA timezone, or "UTC" when unset.
    async fn timezone_of(&self, friendship_id: &FriendshipId) -> String;
}

/// Message history plus the conversation marker the classifier reads.
#[async_trait]
pub trait ConversationLog: Send + Sync {
    /// Persist an inbound user message to history.
    async fn append_user_message(
        &self,
        friendship_id: &FriendshipId,
        message: &UserMessage,
    ) -> anyhow::Result<()>;

    /// The current conversation for a friendship, if one is being tracked.
    async fn current_conversation(&self, friendship_id: &FriendshipId) -> anyhow::Result<Option<Conversation>>;

    /// Start tracking a fresh conversation around `intent`.
    async fn start_conversation(
        &self,
        friendship_id: &FriendshipId,
        intent: &Intent,
        message: &UserMessage,
    ) -> anyhow::Result<()>;

    /// Stop tracking the current conversation (goal finished).
    async fn end_conversation(&self, friendship_id: &FriendshipId) -> anyhow::Result<()>;
}

/// Outbound seam. The orchestrator never renders user-facing text itself; it
/// emits a response-generation instruction and the emitter turns that into a
/// message on the target channel.
#[async_trait]
pub trait ResponseEmitter: Send + Sync {
    async fn emit(
        &self,
        friendship_id: &FriendshipId,
        channel: Channel,
        instruction: &str,
        in_reply_to: &MessageId,
    ) -> anyhow::Result<()>;
}
