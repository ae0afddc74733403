use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies one user relationship. All conversational state is partitioned
/// by friendship id; nothing is shared across friendships.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FriendshipId(pub String);

impl FriendshipId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for FriendshipId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport-level message id. Signal uses the sender timestamp, which is
/// unique per sender and stable across redeliveries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The channel a message arrived on and replies go out on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Signal,
}

/// An inbound message from a friend, as the orchestrator sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub message_id: MessageId,
    pub received_at: DateTime<Utc>,
    pub text: String,
    pub channel: Channel,
}

impl UserMessage {
    pub fn new(
        message_id: MessageId,
        received_at: DateTime<Utc>,
        text: impl Into<String>,
        channel: Channel,
    ) -> Self {
        Self {
            message_id,
            received_at,
            text: text.into(),
            channel,
        }
    }
}

/// The event handed to the orchestrator per inbound message.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub friendship_id: FriendshipId,
    pub message: UserMessage,
}

/// One turn of stored conversation history, role plus text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub from_user: bool,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// The recent conversation for a friendship, newest turn last.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    pub turns: Vec<ConversationTurn>,
}

impl Conversation {
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Render the conversation for inclusion in a classification prompt.
    pub fn transcript(&self) -> String {
        self.turns
            .iter()
            .map(|t| {
                format!(
                    "{}: \"{}\"\n---",
                    if t.from_user { "User" } else { "System" },
                    t.text
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
