use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::interaction::context::GoalContext;
use crate::interaction::intent::Intent;
use crate::interaction::subtask::{
    Params, Subtask, SubtaskClarificationQuestion, SubtaskClarificationResult, SubtaskHandler,
    SubtaskResult, PARAM_ENTITY_DATA, PARAM_ENTITY_ID,
};
use crate::traits::FriendshipLedger;
use crate::types::{FriendshipId, UserMessage};

/// The clarification question and the user's reply, threaded into a second
/// extraction round.
#[derive(Debug, Clone)]
pub struct ClarificationExchange {
    pub question: String,
    pub answer: String,
}

/// Outcome of extracting entity data from the user's text.
#[derive(Debug, Clone)]
pub struct ExtractionResult<E> {
    pub data: Option<E>,
    pub missing_fields: Vec<String>,
    pub clarifying_question: Option<String>,
    pub response_message: Option<String>,
}

impl<E> ExtractionResult<E> {
    pub fn complete(data: E, response_message: Option<String>) -> Self {
        Self {
            data: Some(data),
            missing_fields: Vec::new(),
            clarifying_question: None,
            response_message,
        }
    }

    pub fn incomplete(
        data: Option<E>,
        missing_fields: Vec<String>,
        clarifying_question: Option<String>,
    ) -> Self {
        Self {
            data,
            missing_fields,
            clarifying_question,
            response_message: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.data.is_some() && self.missing_fields.is_empty() && self.clarifying_question.is_none()
    }
}

/// Outcome of resolving which stored entity the user refers to.
#[derive(Debug, Clone)]
pub enum IdResolution {
    /// Resolution was attempted. Unresolved without a question still needs
    /// clarification.
    Clarified {
        id: Option<String>,
        clarifying_question: Option<String>,
    },
    /// The operation does not target an existing entity (e.g. a create).
    NotNeeded { id: Option<String> },
}

impl IdResolution {
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Clarified { id, .. } | Self::NotNeeded { id } => id.as_deref(),
        }
    }

    pub fn clarifying_question(&self) -> Option<&str> {
        match self {
            Self::Clarified { clarifying_question, .. } => clarifying_question.as_deref(),
            Self::NotNeeded { .. } => None,
        }
    }

    pub fn needs_clarification(&self) -> bool {
        match self {
            Self::Clarified { id, clarifying_question } => {
                clarifying_question.is_some() || id.is_none()
            }
            Self::NotNeeded { .. } => false,
        }
    }
}

/// Extraction strategy for one entity type: `E` is the payload written on
/// apply, `F` the stored form listed for id resolution.
#[async_trait]
pub trait CrudEntityHandler<E, F>: Send + Sync {
    async fn extract_entity_data(
        &self,
        raw_text: &str,
        previous_data: Option<&E>,
        exchange: Option<&ClarificationExchange>,
        friendship_id: &FriendshipId,
        timezone: &str,
        message_time: DateTime<Utc>,
    ) -> ExtractionResult<E>;

    async fn identify_entity_id(
        &self,
        all_entities: &[F],
        raw_text: &str,
        exchange: Option<&ClarificationExchange>,
        friendship_id: &FriendshipId,
        timezone: &str,
        message_time: DateTime<Utc>,
    ) -> IdResolution;
}

/// Storage seam for one entity type.
#[async_trait]
pub trait EntitySource<E, F>: Send + Sync {
    async fn load_entities(&self, friendship_id: &FriendshipId) -> anyhow::Result<Vec<F>>;

    async fn apply_update(
        &self,
        friendship_id: &FriendshipId,
        id: Option<&str>,
        entity: E,
    ) -> anyhow::Result<()>;
}

/// Generic subtask handler for create/update/delete operations over one
/// entity type.
///
/// Each round runs id resolution and data extraction concurrently, keeps
/// whatever either produced in the subtask parameters, and only calls
/// `apply_update` once both are settled. Incomplete rounds turn into a single
/// combined clarification question instead.
pub struct CrudSubtaskHandler<E, F> {
    intent: Intent,
    entity_handler: Arc<dyn CrudEntityHandler<E, F>>,
    source: Arc<dyn EntitySource<E, F>>,
    friendship_ledger: Arc<dyn FriendshipLedger>,
    id_question: String,
    data_question: String,
    _marker: PhantomData<fn() -> (E, F)>,
}

impl<E, F> CrudSubtaskHandler<E, F>
where
    E: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    F: Send + Sync + 'static,
{
    pub fn new(
        intent: Intent,
        entity_handler: Arc<dyn CrudEntityHandler<E, F>>,
        source: Arc<dyn EntitySource<E, F>>,
        friendship_ledger: Arc<dyn FriendshipLedger>,
    ) -> Self {
        Self {
            intent,
            entity_handler,
            source,
            friendship_ledger,
            id_question: "Which item should be updated?".to_string(),
            data_question: "What exactly do you want to update?".to_string(),
            _marker: PhantomData,
        }
    }

    pub fn with_id_question(mut self, question: impl Into<String>) -> Self {
        self.id_question = question.into();
        self
    }

    pub fn with_data_question(mut self, question: impl Into<String>) -> Self {
        self.data_question = question.into();
        self
    }

    async fn extraction_round(
        &self,
        subtask: &Subtask,
        context: &GoalContext,
        friendship_id: &FriendshipId,
        raw_text: &str,
        exchange: Option<&ClarificationExchange>,
    ) -> anyhow::Result<(IdResolution, ExtractionResult<E>, Params)> {
        let timezone = self.friendship_ledger.timezone_of(friendship_id).await;
        let message_time = context
            .original_message
            .as_ref()
            .map(|m| m.received_at)
            .unwrap_or_else(Utc::now);

        let all_entities = self.source.load_entities(friendship_id).await?;
        let previous_data: Option<E> = subtask.parameters.entity_data();

        let (id_result, data_result) = tokio::join!(
            self.entity_handler.identify_entity_id(
                &all_entities,
                raw_text,
                exchange,
                friendship_id,
                &timezone,
                message_time,
            ),
            self.entity_handler.extract_entity_data(
                raw_text,
                previous_data.as_ref(),
                exchange,
                friendship_id,
                &timezone,
                message_time,
            ),
        );

        let mut updated_params = subtask.parameters.clone();
        if let Some(id) = id_result.id() {
            updated_params.set(PARAM_ENTITY_ID, Value::String(id.to_string()));
        }
        if let Some(data) = &data_result.data {
            if let Ok(value) = serde_json::to_value(data) {
                updated_params.set(PARAM_ENTITY_DATA, value);
            }
        }
        Ok((id_result, data_result, updated_params))
    }

    fn build_clarification_question(
        &self,
        id_result: &IdResolution,
        data_result: &ExtractionResult<E>,
    ) -> String {
        let mut parts: Vec<String> = Vec::new();
        if id_result.needs_clarification() {
            parts.push(self.id_question.clone());
        }
        if let Some(question) = id_result.clarifying_question() {
            parts.push(question.to_string());
        }
        if !data_result.is_complete() {
            let question = data_result
                .clarifying_question
                .as_deref()
                .filter(|q| !q.trim().is_empty())
                .unwrap_or(&self.data_question);
            parts.push(question.to_string());
        }
        parts.join(" ")
    }
}

#[async_trait]
impl<E, F> SubtaskHandler for CrudSubtaskHandler<E, F>
where
    E: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    F: Send + Sync + 'static,
{
    fn can_handle(&self, intent: &Intent) -> bool {
        *intent == self.intent
    }

    async fn handle(
        &self,
        subtask: &Subtask,
        context: &GoalContext,
        friendship_id: &FriendshipId,
    ) -> SubtaskResult {
        info!(intent = %subtask.intent, "Processing subtask");
        let raw_text = match subtask.parameters.raw_text() {
            Some(text) => text.to_string(),
            None => return SubtaskResult::failure("Missing rawText", subtask.clone()),
        };

        let (id_result, data_result, updated_params) = match self
            .extraction_round(subtask, context, friendship_id, &raw_text, None)
            .await
        {
            Ok(round) => round,
            Err(err) => {
                return SubtaskResult::failure(&format!("Loading entities failed: {err}"), subtask.clone())
            }
        };

        if !data_result.is_complete() || id_result.needs_clarification() {
            return SubtaskResult::needs_clarification(
                subtask.clone().with_parameters(updated_params),
                self.build_clarification_question(&id_result, &data_result),
                data_result.response_message.clone(),
            );
        }

        let entity = match data_result.data.clone() {
            Some(entity) => entity,
            None => return SubtaskResult::failure("Extraction produced no data", subtask.clone()),
        };
        if let Err(err) = self
            .source
            .apply_update(friendship_id, id_result.id(), entity)
            .await
        {
            return SubtaskResult::failure(&format!("Applying update failed: {err}"), subtask.clone());
        }

        let prompt = data_result.response_message.as_ref().map(|msg| {
            format!(
                "Tell the user the intent {} succeeded with result: {msg}",
                subtask.intent
            )
        });
        SubtaskResult::success(subtask.clone(), prompt, Params::new())
    }

    async fn try_resolve_clarification(
        &self,
        subtask: &Subtask,
        question: &SubtaskClarificationQuestion,
        answer: &UserMessage,
        context: &GoalContext,
        friendship_id: &FriendshipId,
    ) -> SubtaskClarificationResult {
        let raw_text = match subtask.parameters.raw_text() {
            Some(text) => text.to_string(),
            None => return SubtaskClarificationResult::failure("Missing rawText", subtask.clone()),
        };
        let exchange = ClarificationExchange {
            question: question.text.clone(),
            answer: answer.text.clone(),
        };

        let (id_result, data_result, updated_params) = match self
            .extraction_round(subtask, context, friendship_id, &raw_text, Some(&exchange))
            .await
        {
            Ok(round) => round,
            Err(err) => {
                return SubtaskClarificationResult::failure(
                    &format!("Loading entities failed: {err}"),
                    subtask.clone(),
                )
            }
        };

        if !data_result.is_complete() || id_result.needs_clarification() {
            return SubtaskClarificationResult::needs_clarification(
                subtask.clone().with_parameters(updated_params),
                self.build_clarification_question(&id_result, &data_result),
            );
        }

        let entity = match data_result.data.clone() {
            Some(entity) => entity,
            None => {
                return SubtaskClarificationResult::failure(
                    "Extraction produced no data",
                    subtask.clone(),
                )
            }
        };
        if let Err(err) = self
            .source
            .apply_update(friendship_id, id_result.id(), entity)
            .await
        {
            return SubtaskClarificationResult::failure(
                &format!("Applying update failed: {err}"),
                subtask.clone(),
            );
        }

        SubtaskClarificationResult::success(
            subtask.clone().with_parameters(updated_params),
            data_result.response_message,
            Params::new(),
        )
    }
}
