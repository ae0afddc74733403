use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::info;

use crate::interaction::classifier::IntentClassification;
use crate::interaction::context::{
    Goal, GoalClarificationQuestion, GoalClarificationResponse, GoalContext, UnstructuredResponse,
};
use crate::interaction::intent::{CoreIntents, Intent, IntentRegistry};
use crate::interaction::registry::{GoalDeterminator, SimpleGoalDeterminator, SubtaskRegistry};
use crate::traits::{ChatMessage, FriendshipLedger, LanguageModel, ModelOptions};
use crate::types::{FriendshipId, UserMessage};

/// A classification below this confidence never becomes a goal.
const INTENT_CONFIDENCE_THRESHOLD: f32 = 0.75;

/// Decides whether classified intents amount to a clear goal, asks for
/// clarification when they do not, and folds compatible follow-up intents
/// into the goal already in flight.
pub struct GoalRefiner {
    llm: Arc<dyn LanguageModel>,
    friendship_ledger: Arc<dyn FriendshipLedger>,
    subtask_registry: Arc<SubtaskRegistry>,
    intent_registry: Arc<IntentRegistry>,
    goal_determinators: Vec<Arc<dyn GoalDeterminator>>,
    default_model: String,
}

impl GoalRefiner {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        friendship_ledger: Arc<dyn FriendshipLedger>,
        subtask_registry: Arc<SubtaskRegistry>,
        intent_registry: Arc<IntentRegistry>,
        goal_determinators: Vec<Arc<dyn GoalDeterminator>>,
        default_model: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            friendship_ledger,
            subtask_registry,
            intent_registry,
            goal_determinators,
            default_model: default_model.into(),
        }
    }

    fn non_goal_intents() -> BTreeSet<Intent> {
        [CoreIntents::cancel_goal(), CoreIntents::unknown(), CoreIntents::smalltalk()]
            .into_iter()
            .collect()
    }

    pub async fn refine_goal(
        &self,
        classifications: &[IntentClassification],
        friendship_id: &FriendshipId,
        message: &UserMessage,
        existing_context: Option<GoalContext>,
    ) -> GoalContext {
        if let Some(context) = &existing_context {
            if context.pending_goal_clarification() {
                return existing_context.unwrap_or_else(GoalContext::none);
            }
        }

        let primary_intents = Self::primary_intents(classifications);
        let non_goal = Self::non_goal_intents();
        if primary_intents.iter().all(|i| non_goal.contains(i)) {
            return Self::context_for_non_goal_intents(&primary_intents, existing_context);
        }

        let new_goals = self.determine_goals(&primary_intents);

        // The user is still pursuing the goal already in flight.
        if let Some(context) = &existing_context {
            if new_goals.len() == 1 && context.goal.as_ref() == new_goals.first() {
                return existing_context.unwrap_or_else(GoalContext::none);
            }
        }

        let existing_goal = existing_context.as_ref().and_then(|c| c.goal.clone());
        let is_compatible = match &existing_goal {
            Some(goal) => {
                self.is_compatible_with(goal, &message.text, &new_goals, friendship_id)
                    .await
            }
            None => false,
        };

        // Subtasks for new intents only; the active goal keeps its own.
        let subtasks: Vec<_> = new_goals
            .iter()
            .map(|g| &g.intent)
            .filter(|intent| Some(*intent) != existing_goal.as_ref().map(|g| &g.intent))
            .flat_map(|intent| {
                self.subtask_registry
                    .subtasks_for(intent, friendship_id, message)
            })
            .collect();

        if is_compatible {
            info!(?primary_intents, "Extending active goal with additional subtasks");
            let mut context = existing_context.unwrap_or_else(GoalContext::none);
            context.subtasks.extend(subtasks);
            context.touched()
        } else if primary_intents.len() == 1 {
            let intent = primary_intents.iter().next().cloned().unwrap_or_else(CoreIntents::unknown);
            info!(intent = %intent, "Setting goal");
            GoalContext {
                goal: Some(Goal::new(intent)),
                original_message: Some(message.clone()),
                goal_clarification_question: None,
                subtasks,
                parameters: Default::default(),
                last_updated: Utc::now(),
                subtask_clarification_questions: Vec::new(),
            }
        } else {
            let candidates = primary_intents
                .iter()
                .map(|i| format!("- {}", i.name()))
                .collect::<Vec<_>>()
                .join("\n");
            GoalContext {
                goal: Some(Goal::new(CoreIntents::unknown())),
                original_message: Some(message.clone()),
                goal_clarification_question: Some(GoalClarificationQuestion {
                    prompt: format!(
                        "Explain that you need more clarity on the user's intent.\n\
                         Ask a question to determine, which of the following intents shall be targeted next:\n\
                         {candidates}"
                    ),
                    intents: primary_intents,
                }),
                subtasks: Vec::new(),
                parameters: Default::default(),
                last_updated: Utc::now(),
                subtask_clarification_questions: Vec::new(),
            }
        }
    }

    /// Resolves an open goal clarification question with the user's reply.
    pub async fn handle_clarification(
        &self,
        friendship_id: &FriendshipId,
        context: &GoalContext,
        message: &UserMessage,
    ) -> GoalClarificationResponse {
        let question = match &context.goal_clarification_question {
            Some(q) => q,
            None => {
                return GoalClarificationResponse::failed(
                    "Goal context has no goal clarification question",
                )
            }
        };

        let timezone = self.friendship_ledger.timezone_of(friendship_id).await;
        let candidates = self
            .intent_registry
            .get_descriptions()
            .iter()
            .filter(|(intent, _)| question.intents.contains(intent))
            .map(|(intent, description)| format!("- \"{}\": {}", intent.name(), description))
            .collect::<Vec<_>>()
            .join("\n");
        let goal_name = context
            .goal
            .as_ref()
            .map(|g| g.description.clone())
            .unwrap_or_default();

        let prompt = format!(
            "Given the user's goal: \"{goal_name}\"\n\
             And the clarification questions:\n{question}\n\
             And the user's response: \"{reply}\"\n\n\
             Classify into one of the following intents:\n{candidates}\n\n\
             Answer in plain JSON with:\n\
             \"isGoalClear\": Is the goal now clear enough to proceed? (true/false)\n\
             \"intent\": If yes, the classified intent\n\
             \"clarificationQuestion\": If not, what additional question needs to be asked?",
            question = question.prompt,
            reply = message.text,
        );

        let response = self
            .llm
            .prompt_for_json(
                &[ChatMessage::user(prompt)],
                &ModelOptions::deterministic(&self.default_model),
                &timezone,
                Utc::now(),
            )
            .await;

        let parsed: Option<Value> = response.and_then(|r| serde_json::from_str(&r).ok());
        let parsed = match parsed {
            Some(value) => value,
            None => {
                return GoalClarificationResponse::failed(
                    "Unable to parse goal clarification response",
                )
            }
        };

        let is_goal_clear = parsed
            .get("isGoalClear")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if is_goal_clear {
            let name = parsed.get("intent").and_then(Value::as_str).unwrap_or("");
            GoalClarificationResponse::resolved(self.intent_registry.resolve(name))
        } else {
            let follow_up = parsed
                .get("clarificationQuestion")
                .and_then(Value::as_str)
                .unwrap_or("What exactly are you trying to accomplish?");
            GoalClarificationResponse::needs_clarification(format!(
                "Thank the user for their response, but explain you still need more clarity.\n\
                 Ask the following question:\n{follow_up}"
            ))
        }
    }

    /// Handles smalltalk and other unstructured intents while a goal is in
    /// flight: with pending subtasks the user is asked whether to continue,
    /// otherwise the context passes through untouched.
    pub async fn on_unstructured_intent(
        &self,
        context: GoalContext,
        message: &UserMessage,
    ) -> UnstructuredResponse {
        let has_pending_subtasks = context.subtasks.iter().any(|s| !s.completed());
        if !has_pending_subtasks {
            return UnstructuredResponse {
                updated_context: context,
                response_prompt: None,
            };
        }

        let goal_name = context
            .goal
            .as_ref()
            .map(|g| g.description.clone())
            .unwrap_or_default();
        let prompt = format!(
            "The user is currently working on the goal: \"{goal_name}\"\n\
             They just sent an unrelated message: \"{text}\"\n\n\
             Please:\n\
             1. Respond to their message in a friendly way\n\
             2. Gently remind them of their current goal\n\
             3. Ask if they want to continue with the goal or abandon it",
            text = message.text,
        );

        let intents: BTreeSet<Intent> = context
            .goal
            .as_ref()
            .map(|g| [g.intent.clone()].into_iter().collect())
            .unwrap_or_default();
        let mut updated = context;
        updated.original_message = Some(message.clone());
        updated.goal_clarification_question = Some(GoalClarificationQuestion {
            prompt: prompt.clone(),
            intents,
        });
        UnstructuredResponse {
            updated_context: updated.touched(),
            response_prompt: Some(prompt),
        }
    }

    fn primary_intents(classifications: &[IntentClassification]) -> BTreeSet<Intent> {
        let max_confidence = classifications
            .iter()
            .map(|c| c.confidence)
            .fold(f32::NEG_INFINITY, f32::max);
        let primary: BTreeSet<Intent> = classifications
            .iter()
            .filter(|c| c.confidence >= INTENT_CONFIDENCE_THRESHOLD)
            .filter(|c| c.confidence == max_confidence)
            .map(|c| c.intent.clone())
            .collect();
        if primary.is_empty() {
            [CoreIntents::unknown()].into_iter().collect()
        } else {
            primary
        }
    }

    fn context_for_non_goal_intents(
        primary_intents: &BTreeSet<Intent>,
        existing_context: Option<GoalContext>,
    ) -> GoalContext {
        match existing_context {
            Some(_) if primary_intents.contains(&CoreIntents::cancel_goal()) => GoalContext::none(),
            Some(context) => context,
            None => GoalContext::none(),
        }
    }

    fn determine_goals(&self, primary_intents: &BTreeSet<Intent>) -> Vec<Goal> {
        let mut goals: Vec<Goal> = Vec::new();
        for intent in primary_intents {
            let intents = [intent.clone()];
            let determined = self
                .goal_determinators
                .iter()
                .find(|d| d.can_handle(&intents))
                .map(|d| d.determine_goals(&intents))
                .unwrap_or_else(|| SimpleGoalDeterminator.determine_goals(&intents));
            for goal in determined {
                if !goals.contains(&goal) {
                    goals.push(goal);
                }
            }
        }
        goals
    }

    async fn is_compatible_with(
        &self,
        current_goal: &Goal,
        message_text: &str,
        new_goals: &[Goal],
        friendship_id: &FriendshipId,
    ) -> bool {
        let timezone = self.friendship_ledger.timezone_of(friendship_id).await;
        let intents = new_goals
            .iter()
            .map(|g| g.intent.name().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let prompt = format!(
            "Given the current goal: \"{goal}\"\n\
             And the new message: \"{message_text}\"\n\
             With intents: {intents}\n\
             Determine if the new message and intents are compatible with the current goal (yes/no).",
            goal = current_goal.intent.name(),
        );

        self.llm
            .prompt_for_text(
                &[ChatMessage::user(prompt)],
                &ModelOptions::deterministic(&self.default_model),
                &timezone,
                Utc::now(),
            )
            .await
            .map(|answer| answer.trim().to_lowercase().starts_with("yes"))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interaction::subtask::{Subtask, SubtaskContributor};
    use crate::testing::{MockLanguageModel, StaticLedger};
    use crate::types::{Channel, MessageId};

    struct OneSubtask(Intent);

    impl SubtaskContributor for OneSubtask {
        fn for_intent(&self) -> Intent {
            self.0.clone()
        }

        fn provide_subtasks(
            &self,
            intent: &Intent,
            friendship_id: &FriendshipId,
            message: &UserMessage,
        ) -> Vec<Subtask> {
            vec![Subtask::for_message(
                intent.clone(),
                format!("Handle {}", intent.name()),
                friendship_id,
                message,
            )]
        }
    }

    fn message(text: &str) -> UserMessage {
        UserMessage::new(MessageId("m1".into()), Utc::now(), text, Channel::Signal)
    }

    fn classification(intent: &str, confidence: f32) -> IntentClassification {
        IntentClassification {
            intent: Intent::new(intent),
            confidence,
        }
    }

    fn refiner(llm: Arc<MockLanguageModel>, intents: &[&str]) -> GoalRefiner {
        use crate::interaction::intent::IntentContributor;

        struct C(String);
        impl IntentContributor for C {
            fn intent(&self) -> Intent {
                Intent::new(self.0.clone())
            }
            fn description(&self) -> String {
                format!("Handle {}", self.0)
            }
        }

        let contributors: Vec<Box<dyn IntentContributor>> = intents
            .iter()
            .map(|name| Box::new(C(name.to_string())) as Box<dyn IntentContributor>)
            .collect();
        let registry = Arc::new(IntentRegistry::new(&contributors));
        let subtasks = Arc::new(SubtaskRegistry::new(
            intents
                .iter()
                .map(|name| Arc::new(OneSubtask(Intent::new(*name))) as Arc<dyn SubtaskContributor>)
                .collect(),
        ));
        GoalRefiner::new(
            llm,
            Arc::new(StaticLedger::utc()),
            subtasks,
            registry,
            vec![],
            "default",
        )
    }

    #[tokio::test]
    async fn single_confident_intent_becomes_the_goal() {
        let refiner = refiner(Arc::new(MockLanguageModel::new()), &["AddTask"]);

        let context = refiner
            .refine_goal(
                &[classification("AddTask", 0.9)],
                &FriendshipId("f".into()),
                &message("add a task"),
                None,
            )
            .await;

        assert_eq!(context.goal, Some(Goal::new(Intent::new("AddTask"))));
        assert_eq!(context.subtasks.len(), 1);
        assert!(!context.pending_goal_clarification());
    }

    #[tokio::test]
    async fn low_confidence_yields_empty_context() {
        let refiner = refiner(Arc::new(MockLanguageModel::new()), &["AddTask"]);

        let context = refiner
            .refine_goal(
                &[classification("AddTask", 0.5)],
                &FriendshipId("f".into()),
                &message("maybe do something"),
                None,
            )
            .await;

        assert!(context.goal.is_none());
        assert!(context.subtasks.is_empty());
    }

    #[tokio::test]
    async fn tie_between_confident_intents_asks_for_clarification() {
        let refiner = refiner(Arc::new(MockLanguageModel::new()), &["AddTask", "SetReminder"]);

        let context = refiner
            .refine_goal(
                &[classification("AddTask", 0.8), classification("SetReminder", 0.8)],
                &FriendshipId("f".into()),
                &message("remember to call mom"),
                None,
            )
            .await;

        assert!(context.pending_goal_clarification());
        assert_eq!(context.goal, Some(Goal::new(CoreIntents::unknown())));
        let question = context.goal_clarification_question.unwrap();
        assert!(question.intents.contains(&Intent::new("AddTask")));
        assert!(question.intents.contains(&Intent::new("SetReminder")));
        assert!(question.prompt.contains("- AddTask"));
    }

    #[tokio::test]
    async fn cancel_goal_clears_existing_context() {
        let refiner = refiner(Arc::new(MockLanguageModel::new()), &["AddTask"]);
        let mut existing = GoalContext::none();
        existing.goal = Some(Goal::new(Intent::new("AddTask")));

        let context = refiner
            .refine_goal(
                &[classification("CancelGoal", 0.95)],
                &FriendshipId("f".into()),
                &message("forget it"),
                Some(existing),
            )
            .await;

        assert!(context.goal.is_none());
    }

    #[tokio::test]
    async fn smalltalk_keeps_existing_context() {
        let refiner = refiner(Arc::new(MockLanguageModel::new()), &["AddTask"]);
        let mut existing = GoalContext::none();
        existing.goal = Some(Goal::new(Intent::new("AddTask")));

        let context = refiner
            .refine_goal(
                &[classification("Smalltalk", 0.9)],
                &FriendshipId("f".into()),
                &message("nice weather"),
                Some(existing.clone()),
            )
            .await;

        assert_eq!(context.goal, existing.goal);
    }

    #[tokio::test]
    async fn pending_goal_clarification_passes_context_through() {
        let refiner = refiner(Arc::new(MockLanguageModel::new()), &["AddTask"]);
        let mut existing = GoalContext::none();
        existing.goal_clarification_question = Some(GoalClarificationQuestion {
            prompt: "Which one?".into(),
            intents: BTreeSet::new(),
        });

        let context = refiner
            .refine_goal(
                &[classification("AddTask", 0.9)],
                &FriendshipId("f".into()),
                &message("add a task"),
                Some(existing.clone()),
            )
            .await;

        assert_eq!(context, existing);
    }

    #[tokio::test]
    async fn compatible_intent_extends_active_goal() {
        let llm = Arc::new(MockLanguageModel::new());
        llm.push_text("yes");
        let refiner = refiner(llm, &["AddTask", "SetReminder"]);
        let mut existing = GoalContext::none();
        existing.goal = Some(Goal::new(Intent::new("AddTask")));
        existing.subtasks = vec![Subtask::for_message(
            Intent::new("AddTask"),
            "Handle AddTask",
            &FriendshipId("f".into()),
            &message("add a task"),
        )];

        let context = refiner
            .refine_goal(
                &[classification("SetReminder", 0.9)],
                &FriendshipId("f".into()),
                &message("and remind me tomorrow"),
                Some(existing),
            )
            .await;

        assert_eq!(context.goal, Some(Goal::new(Intent::new("AddTask"))));
        assert_eq!(context.subtasks.len(), 2);
        assert!(context
            .subtasks
            .iter()
            .any(|s| s.intent == Intent::new("SetReminder")));
    }

    #[tokio::test]
    async fn clarification_reply_resolves_intent() {
        let llm = Arc::new(MockLanguageModel::new());
        llm.push_json(r#"{"isGoalClear": true, "intent": "AddTask"}"#);
        let refiner = refiner(llm, &["AddTask", "SetReminder"]);
        let mut context = GoalContext::none();
        context.goal = Some(Goal::new(CoreIntents::unknown()));
        context.goal_clarification_question = Some(GoalClarificationQuestion {
            prompt: "Task or reminder?".into(),
            intents: [Intent::new("AddTask"), Intent::new("SetReminder")]
                .into_iter()
                .collect(),
        });

        let response = refiner
            .handle_clarification(&FriendshipId("f".into()), &context, &message("a task please"))
            .await;

        assert!(response.clarified());
        assert_eq!(response.intent, Some(Intent::new("AddTask")));
    }

    #[tokio::test]
    async fn unclear_reply_produces_follow_up_question() {
        let llm = Arc::new(MockLanguageModel::new());
        llm.push_json(r#"{"isGoalClear": false, "clarificationQuestion": "Do you want a reminder?"}"#);
        let refiner = refiner(llm, &["AddTask", "SetReminder"]);
        let mut context = GoalContext::none();
        context.goal_clarification_question = Some(GoalClarificationQuestion {
            prompt: "Task or reminder?".into(),
            intents: BTreeSet::new(),
        });

        let response = refiner
            .handle_clarification(&FriendshipId("f".into()), &context, &message("hmm"))
            .await;

        assert!(!response.clarified());
        assert!(response
            .question_prompt
            .as_deref()
            .unwrap()
            .contains("Do you want a reminder?"));
    }

    #[tokio::test]
    async fn unparseable_clarification_reply_is_a_processing_error() {
        let llm = Arc::new(MockLanguageModel::new());
        llm.push_json("not json");
        let refiner = refiner(llm, &["AddTask"]);
        let mut context = GoalContext::none();
        context.goal_clarification_question = Some(GoalClarificationQuestion {
            prompt: "Task or reminder?".into(),
            intents: BTreeSet::new(),
        });

        let response = refiner
            .handle_clarification(&FriendshipId("f".into()), &context, &message("hmm"))
            .await;

        assert!(response.processing_error);
    }

    #[tokio::test]
    async fn unstructured_intent_with_pending_subtasks_asks_to_continue() {
        let refiner = refiner(Arc::new(MockLanguageModel::new()), &["AddTask"]);
        let mut context = GoalContext::none();
        context.goal = Some(Goal::new(Intent::new("AddTask")));
        context.subtasks = vec![Subtask::for_message(
            Intent::new("AddTask"),
            "Handle AddTask",
            &FriendshipId("f".into()),
            &message("add a task"),
        )];

        let response = refiner
            .on_unstructured_intent(context, &message("how are you?"))
            .await;

        assert!(response.response_prompt.is_some());
        assert!(response.updated_context.pending_goal_clarification());
    }

    #[tokio::test]
    async fn unstructured_intent_without_subtasks_passes_through() {
        let refiner = refiner(Arc::new(MockLanguageModel::new()), &["AddTask"]);
        let context = GoalContext::none();

        let response = refiner
            .on_unstructured_intent(context.clone(), &message("how are you?"))
            .await;

        assert!(response.response_prompt.is_none());
        assert_eq!(response.updated_context, context);
    }
}
