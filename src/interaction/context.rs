use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::interaction::intent::Intent;
use crate::interaction::subtask::{
    Params, Subtask, SubtaskClarificationQuestion, SubtaskStatus,
};
use crate::types::UserMessage;

/// The objective a friend is currently pursuing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    pub intent: Intent,
    pub description: String,
}

impl Goal {
    pub fn new(intent: Intent) -> Self {
        let description = intent.name().to_string();
        Self { intent, description }
    }
}

/// Question asked to disambiguate between candidate intents. At most one may
/// be pending per context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalClarificationQuestion {
    pub prompt: String,
    pub intents: BTreeSet<Intent>,
}

/// The full conversational state for one friendship at one point in time.
///
/// Never mutated in place: every transition produces a new value and the
/// orchestrator is the sole writer-through-repository. An empty context
/// (`GoalContext::none()`) means no goal is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalContext {
    pub goal: Option<Goal>,
    pub original_message: Option<UserMessage>,
    pub goal_clarification_question: Option<GoalClarificationQuestion>,
    pub subtasks: Vec<Subtask>,
    pub parameters: Params,
    pub last_updated: DateTime<Utc>,
    pub subtask_clarification_questions: Vec<SubtaskClarificationQuestion>,
}

impl GoalContext {
    pub fn none() -> Self {
        Self {
            goal: None,
            original_message: None,
            goal_clarification_question: None,
            subtasks: Vec::new(),
            parameters: Params::new(),
            last_updated: Utc::now(),
            subtask_clarification_questions: Vec::new(),
        }
    }

    pub fn pending_goal_clarification(&self) -> bool {
        self.goal_clarification_question.is_some()
    }

    pub fn pending_subtask_clarification(&self) -> bool {
        !self.subtask_clarification_questions.is_empty()
    }

    pub fn touched(mut self) -> Self {
        self.last_updated = Utc::now();
        self
    }

    pub fn with_parameters(mut self, parameters: Params) -> Self {
        self.parameters = parameters;
        self
    }

    /// Replace subtasks by id, keeping untouched ones in place.
    pub fn with_updated_subtasks(mut self, updated: Vec<Subtask>) -> Self {
        let updated_ids: Vec<_> = updated.iter().map(|s| s.id.clone()).collect();
        self.subtasks.retain(|s| !updated_ids.contains(&s.id));
        self.subtasks.extend(updated);
        self
    }
}

/// Result of `GoalAchiever::advance`.
#[derive(Debug, Clone)]
pub struct GoalAdvancementResult {
    pub updated_context: GoalContext,
    pub subtask_success_prompts: Vec<String>,
}

impl GoalAdvancementResult {
    pub fn clarification_needed(&self) -> bool {
        !self.updated_context.subtask_clarification_questions.is_empty()
    }

    pub fn complete(&self) -> bool {
        self.updated_context.subtasks.iter().all(Subtask::completed)
    }

    pub fn completed(
        context: GoalContext,
        updated_subtasks: Vec<Subtask>,
        subtask_success_prompts: Vec<String>,
    ) -> Self {
        let mut context = context.with_updated_subtasks(updated_subtasks);
        context.goal_clarification_question = None;
        context.subtask_clarification_questions.clear();
        Self {
            updated_context: context.touched(),
            subtask_success_prompts,
        }
    }

    pub fn subtask_needs_clarification(
        context: GoalContext,
        updated_subtasks: Vec<Subtask>,
        clarification_questions: Vec<SubtaskClarificationQuestion>,
        subtask_success_prompts: Vec<String>,
    ) -> Self {
        let mut context = context.with_updated_subtasks(updated_subtasks);
        context.subtask_clarification_questions = clarification_questions;
        Self {
            updated_context: context.touched(),
            subtask_success_prompts,
        }
    }

    pub fn ongoing(
        context: GoalContext,
        updated_subtasks: Vec<Subtask>,
        subtask_success_prompts: Vec<String>,
    ) -> Self {
        Self {
            updated_context: context.with_updated_subtasks(updated_subtasks).touched(),
            subtask_success_prompts,
        }
    }
}

/// Result of resolving a goal-level clarification with the user's reply.
#[derive(Debug, Clone)]
pub struct GoalClarificationResponse {
    pub question_prompt: Option<String>,
    pub intent: Option<Intent>,
    pub processing_error: bool,
}

impl GoalClarificationResponse {
    pub fn clarified(&self) -> bool {
        !self.processing_error && self.intent.is_some()
    }

    pub fn resolved(intent: Intent) -> Self {
        Self {
            question_prompt: None,
            intent: Some(intent),
            processing_error: false,
        }
    }

    pub fn needs_clarification(question_prompt: impl Into<String>) -> Self {
        Self {
            question_prompt: Some(question_prompt.into()),
            intent: None,
            processing_error: false,
        }
    }

    pub fn failed(error: &str) -> Self {
        error!("Failed to clarify goal: {error}");
        Self {
            question_prompt: None,
            intent: None,
            processing_error: true,
        }
    }
}

/// Result of resolving a subtask-level clarification within a context, as
/// returned by `GoalAchiever::handle_clarification`.
#[derive(Debug, Clone)]
pub struct SubtaskClarificationResponse {
    pub updated_context: GoalContext,
    pub clarification_question: Option<String>,
    pub success_message_prompt: Option<String>,
    pub has_processing_error: bool,
}

impl SubtaskClarificationResponse {
    pub fn clarified(&self) -> bool {
        !self.has_processing_error && self.clarification_question.is_none()
    }

    pub fn still_needs_clarification(
        context: GoalContext,
        updated_subtask: Subtask,
        question_prompt: String,
        replacement_question: SubtaskClarificationQuestion,
        success_message_prompt: Option<String>,
    ) -> Self {
        let mut context = context.with_updated_subtasks(vec![updated_subtask]);
        context
            .subtask_clarification_questions
            .retain(|q| q.related_subtask != replacement_question.related_subtask);
        context.subtask_clarification_questions.push(replacement_question);
        Self {
            updated_context: context.touched(),
            clarification_question: Some(question_prompt),
            success_message_prompt,
            has_processing_error: false,
        }
    }

    pub fn clarified_subtask(
        context: GoalContext,
        updated_subtask: Subtask,
        success_message_prompt: Option<String>,
    ) -> Self {
        let subtask_id = updated_subtask.id.clone();
        let mut context = context.with_updated_subtasks(vec![updated_subtask]);
        context
            .subtask_clarification_questions
            .retain(|q| q.related_subtask != subtask_id);
        Self {
            updated_context: context.touched(),
            clarification_question: None,
            success_message_prompt,
            has_processing_error: false,
        }
    }

    pub fn aborted(
        context: GoalContext,
        aborted_subtask: &Subtask,
        success_message_prompt: Option<String>,
    ) -> Self {
        debug!(subtask = %aborted_subtask.id, "Aborted subtask on user request");
        let updated = aborted_subtask.clone().with_status(SubtaskStatus::Aborted);
        let subtask_id = updated.id.clone();
        let mut context = context.with_updated_subtasks(vec![updated]);
        context
            .subtask_clarification_questions
            .retain(|q| q.related_subtask != subtask_id);
        Self {
            updated_context: context.touched(),
            clarification_question: None,
            success_message_prompt,
            has_processing_error: false,
        }
    }

    pub fn failed(context: GoalContext, error: &str) -> Self {
        error!("Failed clarification with error: {error}");
        Self {
            updated_context: context.touched(),
            clarification_question: None,
            success_message_prompt: None,
            has_processing_error: true,
        }
    }
}

/// Response from handling an unstructured intent (smalltalk etc.) while a
/// goal is in flight.
#[derive(Debug, Clone)]
pub struct UnstructuredResponse {
    pub updated_context: GoalContext,
    pub response_prompt: Option<String>,
}
