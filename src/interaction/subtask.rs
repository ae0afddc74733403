use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::interaction::context::GoalContext;
use crate::interaction::intent::Intent;
use crate::types::{FriendshipId, MessageId, UserMessage};

/// Identifies a subtask. Content-addressed: derived deterministically from
/// its inputs, so re-deriving for a redelivered message yields the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubtaskId(String);

impl SubtaskId {
    pub fn derive(friendship_id: &FriendshipId, intent: &Intent, message_id: &MessageId) -> Self {
        Self(format!("{}/{}/{}", friendship_id, intent, message_id))
    }

    #[cfg(test)]
    pub fn raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for SubtaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubtaskStatus {
    Pending,
    InProgress,
    InClarification,
    Completed,
    Failed,
    Aborted,
}

/// Open parameter bag accumulating extraction results across turns.
///
/// Keys have per-key serialization contracts rather than static types:
/// `rawText` is a string, `id` a string, `entityData` whatever the owning
/// handler serializes. Handlers that disagree on a key simply overwrite it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, Value>);

pub const PARAM_RAW_TEXT: &str = "rawText";
pub const PARAM_ENTITY_ID: &str = "id";
pub const PARAM_ENTITY_DATA: &str = "entityData";

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_raw_text(text: impl Into<String>) -> Self {
        let mut params = Self::new();
        params.set(PARAM_RAW_TEXT, Value::String(text.into()));
        params
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn raw_text(&self) -> Option<&str> {
        self.0.get(PARAM_RAW_TEXT).and_then(Value::as_str)
    }

    pub fn entity_id(&self) -> Option<&str> {
        self.0.get(PARAM_ENTITY_ID).and_then(Value::as_str)
    }

    pub fn entity_data<E: DeserializeOwned>(&self) -> Option<E> {
        self.0
            .get(PARAM_ENTITY_DATA)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Shallow merge, `other`'s keys winning on conflict.
    pub fn merged_with(&self, other: &Params) -> Params {
        let mut merged = self.0.clone();
        for (k, v) in &other.0 {
            merged.insert(k.clone(), v.clone());
        }
        Params(merged)
    }
}

/// One concrete unit of work needed to satisfy a goal, independently
/// resolvable and clarifiable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub id: SubtaskId,
    pub intent: Intent,
    pub description: String,
    pub parameters: Params,
    pub status: SubtaskStatus,
}

impl Subtask {
    pub fn new(id: SubtaskId, intent: Intent, description: impl Into<String>, parameters: Params) -> Self {
        Self {
            id,
            intent,
            description: description.into(),
            parameters,
            status: SubtaskStatus::Pending,
        }
    }

    /// The usual contributor path: id derived from the triggering message,
    /// parameters seeded with the raw message text.
    pub fn for_message(
        intent: Intent,
        description: impl Into<String>,
        friendship_id: &FriendshipId,
        message: &UserMessage,
    ) -> Self {
        let id = SubtaskId::derive(friendship_id, &intent, &message.message_id);
        Self::new(id, intent, description, Params::with_raw_text(&message.text))
    }

    pub fn needs_clarification(&self) -> bool {
        self.status == SubtaskStatus::InClarification
    }

    pub fn completed(&self) -> bool {
        matches!(self.status, SubtaskStatus::Completed | SubtaskStatus::Aborted)
    }

    pub fn with_status(mut self, status: SubtaskStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_parameters(mut self, parameters: Params) -> Self {
        self.parameters = parameters;
        self
    }
}

/// A follow-up question pending for exactly one subtask. Keyed by subtask id
/// so resolution is independent per subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskClarificationQuestion {
    pub text: String,
    pub related_subtask: SubtaskId,
}

/// Outcome of `SubtaskHandler::handle` for one subtask.
#[derive(Debug, Clone)]
pub struct SubtaskResult {
    pub success_message_prompt: Option<String>,
    pub clarification_question: Option<SubtaskClarificationQuestion>,
    pub updated_subtask: Subtask,
    pub updated_context_parameters: Params,
}

impl SubtaskResult {
    /// Terminal failure, e.g. a subtask missing its `rawText`. Not retried.
    pub fn failure(error: &str, subtask: Subtask) -> Self {
        error!(subtask = %subtask.id, "Subtask failed: {error}");
        Self {
            success_message_prompt: None,
            clarification_question: None,
            updated_subtask: subtask.with_status(SubtaskStatus::Failed),
            updated_context_parameters: Params::new(),
        }
    }

    pub fn needs_clarification(
        subtask: Subtask,
        question: impl Into<String>,
        success_message_prompt: Option<String>,
    ) -> Self {
        let question = SubtaskClarificationQuestion {
            text: question.into(),
            related_subtask: subtask.id.clone(),
        };
        Self {
            success_message_prompt,
            clarification_question: Some(question),
            updated_subtask: subtask.with_status(SubtaskStatus::InClarification),
            updated_context_parameters: Params::new(),
        }
    }

    pub fn success(
        subtask: Subtask,
        success_message_prompt: Option<String>,
        updated_context_parameters: Params,
    ) -> Self {
        Self {
            success_message_prompt,
            clarification_question: None,
            updated_subtask: subtask.with_status(SubtaskStatus::Completed),
            updated_context_parameters,
        }
    }

    pub fn in_progress(subtask: Subtask, success_message_prompt: Option<String>) -> Self {
        Self {
            success_message_prompt,
            clarification_question: None,
            updated_subtask: subtask.with_status(SubtaskStatus::InProgress),
            updated_context_parameters: Params::new(),
        }
    }
}

/// Outcome of `SubtaskHandler::try_resolve_clarification`.
#[derive(Debug, Clone)]
pub struct SubtaskClarificationResult {
    pub clarification_question: Option<SubtaskClarificationQuestion>,
    pub success_message_prompt: Option<String>,
    pub has_processing_error: bool,
    pub updated_subtask: Subtask,
    pub updated_context_parameters: Params,
}

impl SubtaskClarificationResult {
    pub fn clarification_needed(&self) -> bool {
        self.clarification_question.is_some()
    }

    pub fn needs_clarification(subtask: Subtask, question: impl Into<String>) -> Self {
        let question = SubtaskClarificationQuestion {
            text: question.into(),
            related_subtask: subtask.id.clone(),
        };
        Self {
            clarification_question: Some(question),
            success_message_prompt: None,
            has_processing_error: false,
            updated_subtask: subtask.with_status(SubtaskStatus::InClarification),
            updated_context_parameters: Params::new(),
        }
    }

    pub fn failure(error: &str, subtask: Subtask) -> Self {
        error!(subtask = %subtask.id, "Subtask clarification failure: {error}");
        Self {
            clarification_question: None,
            success_message_prompt: None,
            has_processing_error: true,
            updated_subtask: subtask.with_status(SubtaskStatus::Failed),
            updated_context_parameters: Params::new(),
        }
    }

    pub fn success(
        subtask: Subtask,
        success_message_prompt: Option<String>,
        updated_context_parameters: Params,
    ) -> Self {
        debug!(subtask = %subtask.id, "Subtask clarification resolved");
        Self {
            clarification_question: None,
            success_message_prompt,
            has_processing_error: false,
            updated_subtask: subtask.with_status(SubtaskStatus::Completed),
            updated_context_parameters,
        }
    }
}

/// The contract every domain handler implements. Selected by `can_handle`
/// from an explicit registration list; exactly one handler is expected to
/// match a subtask's intent.
#[async_trait]
pub trait SubtaskHandler: Send + Sync {
    fn can_handle(&self, intent: &Intent) -> bool;

    fn can_handle_subtask(&self, subtask: &Subtask) -> bool {
        self.can_handle(&subtask.intent)
    }

    async fn handle(
        &self,
        subtask: &Subtask,
        context: &GoalContext,
        friendship_id: &FriendshipId,
    ) -> SubtaskResult;

    async fn try_resolve_clarification(
        &self,
        subtask: &Subtask,
        question: &SubtaskClarificationQuestion,
        answer: &UserMessage,
        context: &GoalContext,
        friendship_id: &FriendshipId,
    ) -> SubtaskClarificationResult;
}

/// Synthesizes zero or more subtasks from a message, per intent.
pub trait SubtaskContributor: Send + Sync {
    fn for_intent(&self) -> Intent;

    fn provide_subtasks(
        &self,
        intent: &Intent,
        friendship_id: &FriendshipId,
        message: &UserMessage,
    ) -> Vec<Subtask>;
}
