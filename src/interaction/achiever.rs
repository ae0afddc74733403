use std::sync::Arc;

use futures::future::join_all;
use tracing::error;

use crate::interaction::context::{
    GoalAdvancementResult, GoalContext, SubtaskClarificationResponse,
};
use crate::interaction::subtask::{Subtask, SubtaskHandler, SubtaskResult};
use crate::traits::{ChatMessage, FriendshipLedger, LanguageModel, ModelOptions};
use crate::types::{FriendshipId, UserMessage};

/// Drives the incomplete subtasks of a goal towards completion by fanning
/// them out to their handlers, and resolves pending subtask clarifications.
pub struct GoalAchiever {
    subtask_handlers: Vec<Arc<dyn SubtaskHandler>>,
    llm: Arc<dyn LanguageModel>,
    friendship_ledger: Arc<dyn FriendshipLedger>,
    precision_model: String,
}

impl GoalAchiever {
    pub fn new(
        subtask_handlers: Vec<Arc<dyn SubtaskHandler>>,
        llm: Arc<dyn LanguageModel>,
        friendship_ledger: Arc<dyn FriendshipLedger>,
        precision_model: impl Into<String>,
    ) -> Self {
        Self {
            subtask_handlers,
            llm,
            friendship_ledger,
            precision_model: precision_model.into(),
        }
    }

    /// Dispatches every incomplete subtask to its handler concurrently and
    /// folds the results back into one context update.
    pub async fn advance(
        &self,
        context: GoalContext,
        friendship_id: &FriendshipId,
        _message: &UserMessage,
    ) -> GoalAdvancementResult {
        if context.subtasks.is_empty() || context.subtasks.iter().all(Subtask::completed) {
            return GoalAdvancementResult::completed(context, vec![], vec![]);
        }

        let dispatches: Vec<_> = context
            .subtasks
            .iter()
            .filter(|s| !s.completed())
            .filter_map(|subtask| {
                let handlers: Vec<_> = self
                    .subtask_handlers
                    .iter()
                    .filter(|h| h.can_handle_subtask(subtask))
                    .collect();
                match handlers.split_first() {
                    None => {
                        error!(intent = %subtask.intent, "No handler for subtask found");
                        None
                    }
                    Some((first, rest)) => {
                        if !rest.is_empty() {
                            error!(
                                intent = %subtask.intent,
                                "Multiple handlers for subtask found, processing with first"
                            );
                        }
                        Some(first.handle(subtask, &context, friendship_id))
                    }
                }
            })
            .collect();
        let subtask_results: Vec<SubtaskResult> = join_all(dispatches).await;

        let success_prompts: Vec<String> = subtask_results
            .iter()
            .filter_map(|r| r.success_message_prompt.clone())
            .collect();
        let mut merged_parameters = context.parameters.clone();
        for result in &subtask_results {
            merged_parameters = merged_parameters.merged_with(&result.updated_context_parameters);
        }
        let context = context.with_parameters(merged_parameters);

        let updated_subtasks: Vec<Subtask> = subtask_results
            .iter()
            .map(|r| r.updated_subtask.clone())
            .collect();
        let clarification_questions: Vec<_> = subtask_results
            .iter()
            .filter_map(|r| r.clarification_question.clone())
            .collect();

        if !clarification_questions.is_empty() {
            GoalAdvancementResult::subtask_needs_clarification(
                context,
                updated_subtasks,
                clarification_questions,
                success_prompts,
            )
        } else if subtask_results.iter().all(|r| r.updated_subtask.completed()) {
            GoalAdvancementResult::completed(context, updated_subtasks, success_prompts)
        } else {
            GoalAdvancementResult::ongoing(context, updated_subtasks, success_prompts)
        }
    }

    /// Resolves the first pending subtask clarification with the user's
    /// reply. An explicit wish to abort short-circuits resolution.
    pub async fn handle_clarification(
        &self,
        friendship_id: &FriendshipId,
        context: GoalContext,
        message: &UserMessage,
    ) -> SubtaskClarificationResponse {
        let question = match context.subtask_clarification_questions.first() {
            Some(q) => q.clone(),
            None => {
                return SubtaskClarificationResponse::failed(
                    context,
                    "No subtask needs clarification",
                )
            }
        };
        let subtask = match context
            .subtasks
            .iter()
            .find(|s| s.id == question.related_subtask)
        {
            Some(s) => s.clone(),
            None => {
                return SubtaskClarificationResponse::failed(
                    context,
                    "No subtask for subtask clarification found",
                )
            }
        };
        let handler = match self
            .subtask_handlers
            .iter()
            .find(|h| h.can_handle_subtask(&subtask))
        {
            Some(h) => Arc::clone(h),
            None => {
                return SubtaskClarificationResponse::failed(
                    context,
                    "No handler for subtask clarification found",
                )
            }
        };

        // The abort check must settle before the handler runs: resolving the
        // answer can apply the mutation, and an aborted subtask must not.
        if self.verify_user_wants_to_abort(friendship_id, message).await {
            return SubtaskClarificationResponse::aborted(
                context,
                &subtask,
                Some(format!(
                    "Tell the user that Subtask \"{}\" was aborted according to their request!",
                    subtask.description
                )),
            );
        }

        let resolution = handler
            .try_resolve_clarification(&subtask, &question, message, &context, friendship_id)
            .await;

        let merged = context
            .parameters
            .merged_with(&resolution.updated_context_parameters);
        let context = context.with_parameters(merged);
        if resolution.has_processing_error {
            SubtaskClarificationResponse::failed(context, "Error while handling subtask clarification")
        } else if resolution.clarification_needed() {
            let follow_up = resolution
                .clarification_question
                .clone()
                .map(|q| q.text)
                .unwrap_or_default();
            let prompt = format!(
                "Ask the user for clarification to continue with the task {}. The following question must be asked:\n\
                 {follow_up}\n\
                 Make it easy and friendly to answer.",
                resolution.updated_subtask.description,
            );
            let replacement = resolution
                .clarification_question
                .clone()
                .unwrap_or_else(|| question.clone());
            SubtaskClarificationResponse::still_needs_clarification(
                context,
                resolution.updated_subtask,
                prompt,
                replacement,
                resolution.success_message_prompt,
            )
        } else {
            SubtaskClarificationResponse::clarified_subtask(
                context,
                resolution.updated_subtask,
                resolution.success_message_prompt,
            )
        }
    }

    async fn verify_user_wants_to_abort(
        &self,
        friendship_id: &FriendshipId,
        message: &UserMessage,
    ) -> bool {
        let timezone = self.friendship_ledger.timezone_of(friendship_id).await;
        let prompt = format!(
            "Given the message:\n\"{}\"\n---\n\
             Does the user explicitly intend to abort the current task?\n\
             Return yes or no. No explanation, no chat.",
            message.text
        );
        self.llm
            .prompt_for_text(
                &[
                    ChatMessage::system("You are a intent detector."),
                    ChatMessage::user(prompt),
                ],
                &ModelOptions::deterministic(&self.precision_model).with_top_p(0.8),
                &timezone,
                message.received_at,
            )
            .await
            .map(|answer| answer.trim().to_lowercase().starts_with("yes"))
            .unwrap_or(false)
    }
}
