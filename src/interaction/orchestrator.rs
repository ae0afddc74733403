use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info};

use crate::interaction::achiever::GoalAchiever;
use crate::interaction::classifier::{IntentClassification, IntentClassifier};
use crate::interaction::context::GoalContext;
use crate::interaction::intent::{CoreIntents, Intent};
use crate::interaction::refiner::GoalRefiner;
use crate::traits::{ConversationLog, GoalContextRepository, ResponseEmitter};
use crate::types::{InboundMessage, UserMessage};

/// A context older than this is treated as abandoned and discarded.
const MAX_MINUTES_TO_CLARIFICATION: i64 = 15;

const TROUBLE_UNDERSTANDING_INSTRUCTION: &str =
    "Tell the user you are having trouble understanding their request. Ask them to rephrase it.";

/// Per-message control loop. Resolves pending clarifications first, then
/// classifies, refines the goal, advances its subtasks and picks exactly one
/// outgoing response instruction.
///
/// Everything conversational degrades into a reply; only persistence and
/// transport failures propagate to the caller.
pub struct ConversationOrchestrator {
    intent_classifier: Arc<IntentClassifier>,
    goal_refiner: Arc<GoalRefiner>,
    goal_achiever: Arc<GoalAchiever>,
    context_repository: Arc<dyn GoalContextRepository>,
    conversation_log: Arc<dyn ConversationLog>,
    emitter: Arc<dyn ResponseEmitter>,
}

impl ConversationOrchestrator {
    pub fn new(
        intent_classifier: Arc<IntentClassifier>,
        goal_refiner: Arc<GoalRefiner>,
        goal_achiever: Arc<GoalAchiever>,
        context_repository: Arc<dyn GoalContextRepository>,
        conversation_log: Arc<dyn ConversationLog>,
        emitter: Arc<dyn ResponseEmitter>,
    ) -> Self {
        Self {
            intent_classifier,
            goal_refiner,
            goal_achiever,
            context_repository,
            conversation_log,
            emitter,
        }
    }

    pub async fn on_message(&self, event: &InboundMessage) -> anyhow::Result<()> {
        let friendship_id = &event.friendship_id;
        let message = &event.message;
        self.conversation_log
            .append_user_message(friendship_id, message)
            .await?;
        let mut goal_context = self.context_repository.load_context(friendship_id).await?;
        debug!(
            friendship = %friendship_id,
            "Incoming message \"{}\" with current goal {:?}",
            message.text,
            goal_context.as_ref().and_then(|c| c.goal.clone()),
        );

        let mut clarified_intent: Option<Intent> = None;
        let mut result_prompts: Vec<String> = Vec::new();

        let fresh = goal_context
            .as_ref()
            .map(|c| {
                (Utc::now() - c.last_updated).abs() < Duration::minutes(MAX_MINUTES_TO_CLARIFICATION)
            })
            .unwrap_or(false);
        if fresh {
            if let Some(mut context) = goal_context.take() {
                if context.pending_goal_clarification() {
                    info!("Goal clarification is pending, processing answer");
                    let response = self
                        .goal_refiner
                        .handle_clarification(friendship_id, &context, message)
                        .await;
                    if response.clarified() {
                        clarified_intent = response.intent;
                        context.goal_clarification_question = None;
                        context = context.touched();
                        self.context_repository
                            .save_context(friendship_id, &context)
                            .await?;
                    } else if let Some(prompt) = response.question_prompt {
                        if let Some(question) = &mut context.goal_clarification_question {
                            question.prompt = prompt.clone();
                        }
                        self.context_repository
                            .save_context(friendship_id, &context)
                            .await?;
                        return self.reply(event, &prompt).await;
                    } else {
                        return self.reply(event, TROUBLE_UNDERSTANDING_INSTRUCTION).await;
                    }
                }
                if context.pending_subtask_clarification() {
                    info!("Subtask clarification is pending, processing answer");
                    let response = self
                        .goal_achiever
                        .handle_clarification(friendship_id, context, message)
                        .await;
                    self.context_repository
                        .save_context(friendship_id, &response.updated_context)
                        .await?;
                    if response.has_processing_error {
                        return self.reply(event, TROUBLE_UNDERSTANDING_INSTRUCTION).await;
                    }
                    if let Some(question) = &response.clarification_question {
                        let interim = response
                            .success_message_prompt
                            .as_ref()
                            .map(|p| format!("Their current task has the following response:\n{p}\n"))
                            .unwrap_or_default();
                        let instruction = format!(
                            "{interim}Ask the user the following question to continue with their task:\n\
                             {question}\n\
                             Make it easy and friendly to answer."
                        );
                        return self.reply(event, &instruction).await;
                    }
                    if let Some(prompt) = response.success_message_prompt {
                        result_prompts.push(prompt);
                    }
                    goal_context = Some(response.updated_context);
                } else {
                    goal_context = Some(context);
                }
            }
        } else {
            // Stale or absent context: forget it and track a fresh conversation.
            self.conversation_log
                .start_conversation(friendship_id, &CoreIntents::unknown(), message)
                .await?;
            goal_context = None;
        }

        let classifications = match clarified_intent {
            Some(intent) => {
                info!(intent = %intent, "Using clarified intent, skipping classification");
                vec![IntentClassification { intent, confidence: 1.0 }]
            }
            None => match self.conversation_log.current_conversation(friendship_id).await? {
                Some(conversation) if !conversation.is_empty() => {
                    self.intent_classifier
                        .classify_conversation(&conversation, message)
                        .await
                }
                _ => self.intent_classifier.classify_message(message).await,
            },
        };
        let primary_intent = classifications
            .iter()
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .map(|c| c.intent.clone())
            .unwrap_or_else(CoreIntents::unknown);

        if primary_intent == CoreIntents::smalltalk() || primary_intent == CoreIntents::unknown() {
            if let Some(context) = goal_context {
                let response = self
                    .goal_refiner
                    .on_unstructured_intent(context, message)
                    .await;
                self.context_repository
                    .save_context(friendship_id, &response.updated_context)
                    .await?;
                if let Some(prompt) = response.response_prompt {
                    return self.reply(event, &prompt).await;
                }
            }
            return self
                .reply(
                    event,
                    "You are an empathic assistant for neurodivergent people.\nAnswer kindly and briefly.",
                )
                .await;
        }

        let previous_goal_intent = goal_context
            .as_ref()
            .and_then(|c| c.goal.as_ref().map(|g| g.intent.clone()));
        let refined = self
            .goal_refiner
            .refine_goal(&classifications, friendship_id, message, goal_context)
            .await;
        if let Some(goal) = &refined.goal {
            if Some(&goal.intent) != previous_goal_intent.as_ref() {
                self.conversation_log
                    .start_conversation(friendship_id, &goal.intent, message)
                    .await?;
            }
        }
        if refined.pending_goal_clarification() {
            self.context_repository
                .save_context(friendship_id, &refined)
                .await?;
            let prompt = refined
                .goal_clarification_question
                .as_ref()
                .map(|q| q.prompt.clone())
                .unwrap_or_default();
            return self.reply(event, &prompt).await;
        }
        info!(
            goal = ?refined.goal,
            ongoing_subtasks = refined.subtasks.iter().filter(|s| !s.completed()).count(),
            "Advancing goal",
        );

        let result = self.goal_achiever.advance(refined, friendship_id, message).await;
        self.context_repository
            .save_context(friendship_id, &result.updated_context)
            .await?;
        result_prompts.extend(result.subtask_success_prompts.clone());

        if result.clarification_needed() {
            info!("Replying with subtask clarification question");
            let questions = result
                .updated_context
                .subtask_clarification_questions
                .iter()
                .map(|q| format!("- {}", q.text))
                .collect::<Vec<_>>()
                .join("\n");
            let instruction = format!(
                "For the answer combine the following instructions:\n{prompts}\n---\n\
                 Ask the user to answer the following question(s) to continue with their task(s):\n\
                 {questions}\n\
                 Make it easy and friendly to answer.\n\
                 Just return the questions, no explanation!",
                prompts = Self::combined(&result_prompts),
            );
            self.reply(event, &instruction).await
        } else if result.complete() {
            info!(goal = ?result.updated_context.goal, "Goal completed");
            self.context_repository
                .save_context(friendship_id, &GoalContext::none())
                .await?;
            let instruction = format!(
                "For the answer combine the following instructions:\n{prompts}\n\
                 \"Answer by asking if there is more todo.\"",
                prompts = Self::combined(&result_prompts),
            );
            self.reply(event, &instruction).await?;
            self.conversation_log.end_conversation(friendship_id).await
        } else if !result_prompts.is_empty() {
            let instruction = format!(
                "For the answer combine the following instructions:\n{}",
                Self::combined(&result_prompts),
            );
            self.reply(event, &instruction).await
        } else {
            info!(goal = ?result.updated_context.goal, "Goal still ongoing");
            let context = &result.updated_context;
            let outstanding = context
                .subtasks
                .iter()
                .filter(|s| !s.completed())
                .map(|s| format!("\"{}\"", s.intent))
                .collect::<Vec<_>>()
                .join(", ");
            let original_text = context
                .original_message
                .as_ref()
                .map(|m| m.text.clone())
                .unwrap_or_default();
            let goal_name = context
                .goal
                .as_ref()
                .map(|g| g.intent.name().to_string())
                .unwrap_or_default();
            let instruction = format!(
                "The friend intended to achieve the goal {goal_name} by initially sending the message \"{original_text}\".\n\
                 While achieving the goal the following subtasks are not yet done: {outstanding}.\n\
                 Tell the friend about this current ongoing process."
            );
            self.reply(event, &instruction).await
        }
    }

    async fn reply(&self, event: &InboundMessage, instruction: &str) -> anyhow::Result<()> {
        self.emitter
            .emit(
                &event.friendship_id,
                event.message.channel,
                instruction,
                &event.message.message_id,
            )
            .await
    }

    fn combined(prompts: &[String]) -> String {
        prompts.join("\n---\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interaction::context::Goal;
    use crate::interaction::intent::{IntentContributor, IntentRegistry};
    use crate::interaction::registry::SubtaskRegistry;
    use crate::interaction::subtask::{
        Params, SubtaskClarificationQuestion, SubtaskHandler, SubtaskStatus,
    };
    use crate::testing::{
        InMemoryConversationLog, InMemoryGoalContexts, MockLanguageModel, RecordingEmitter,
        ScriptedSubtaskHandler, StaticLedger, StaticSubtaskContributor,
    };
    use crate::types::{Channel, FriendshipId, MessageId};

    struct Described(&'static str, &'static str);

    impl IntentContributor for Described {
        fn intent(&self) -> Intent {
            Intent::new(self.0)
        }
        fn description(&self) -> String {
            self.1.to_string()
        }
    }

    struct Fixture {
        orchestrator: ConversationOrchestrator,
        llm: Arc<MockLanguageModel>,
        contexts: Arc<InMemoryGoalContexts>,
        log: Arc<InMemoryConversationLog>,
        emitter: Arc<RecordingEmitter>,
    }

    fn fixture(handlers: Vec<Arc<dyn SubtaskHandler>>) -> Fixture {
        let llm = Arc::new(MockLanguageModel::new());
        let contexts = Arc::new(InMemoryGoalContexts::new());
        let log = Arc::new(InMemoryConversationLog::new());
        let emitter = Arc::new(RecordingEmitter::new());
        let ledger = Arc::new(StaticLedger::utc());

        let contributors: Vec<Box<dyn IntentContributor>> = vec![
            Box::new(Described("AddTask", "Add a task to the task list")),
            Box::new(Described("SetReminder", "Set a reminder")),
        ];
        let intent_registry = Arc::new(IntentRegistry::new(&contributors));
        let subtask_registry = Arc::new(SubtaskRegistry::new(vec![
            Arc::new(StaticSubtaskContributor::new(Intent::new("AddTask"), "Store the task")),
            Arc::new(StaticSubtaskContributor::new(Intent::new("SetReminder"), "Store the reminder")),
        ]));

        let classifier = Arc::new(IntentClassifier::new(
            llm.clone(),
            intent_registry.clone(),
            "default",
            "precise",
            Intent::new("AddTask"),
        ));
        let refiner = Arc::new(GoalRefiner::new(
            llm.clone(),
            ledger.clone(),
            subtask_registry,
            intent_registry,
            vec![],
            "default",
        ));
        let achiever = Arc::new(GoalAchiever::new(handlers, llm.clone(), ledger, "precise"));

        let orchestrator = ConversationOrchestrator::new(
            classifier,
            refiner,
            achiever,
            contexts.clone(),
            log.clone(),
            emitter.clone(),
        );
        Fixture {
            orchestrator,
            llm,
            contexts,
            log,
            emitter,
        }
    }

    fn event(text: &str) -> InboundMessage {
        InboundMessage {
            friendship_id: FriendshipId("f".into()),
            message: UserMessage::new(MessageId("m1".into()), Utc::now(), text, Channel::Signal),
        }
    }

    #[tokio::test]
    async fn completed_goal_resets_context_and_asks_for_more() {
        let fixture = fixture(vec![Arc::new(ScriptedSubtaskHandler::completing(
            Intent::new("AddTask"),
            "Stored the task",
        ))]);
        fixture.llm.push_json(r#"[{"intent":"AddTask","confidence":0.9}]"#);
        fixture.llm.push_text("no");

        fixture.orchestrator.on_message(&event("add a task to call mom")).await.unwrap();

        let saved = fixture.contexts.load(&FriendshipId("f".into())).await.unwrap();
        assert!(saved.goal.is_none());
        assert!(saved.subtasks.is_empty());
        let instruction = fixture.emitter.last_instruction().unwrap();
        assert!(instruction.contains("Stored the task"));
        assert!(instruction.contains("more todo"));
        assert!(fixture.log.conversation_ended(&FriendshipId("f".into())));
    }

    #[tokio::test]
    async fn clarification_question_is_persisted_and_sent() {
        let fixture = fixture(vec![Arc::new(ScriptedSubtaskHandler::clarifying(
            Intent::new("SetReminder"),
            "When should I remind you?",
        ))]);
        fixture.llm.push_json(r#"[{"intent":"SetReminder","confidence":0.9}]"#);
        fixture.llm.push_text("no");

        fixture.orchestrator.on_message(&event("remind me to call mom")).await.unwrap();

        let saved = fixture.contexts.load(&FriendshipId("f".into())).await.unwrap();
        assert_eq!(saved.subtask_clarification_questions.len(), 1);
        let instruction = fixture.emitter.last_instruction().unwrap();
        assert!(instruction.contains("- When should I remind you?"));
    }

    #[tokio::test]
    async fn smalltalk_without_goal_gets_a_friendly_answer() {
        let fixture = fixture(vec![]);
        fixture.llm.push_json(r#"[{"intent":"Smalltalk","confidence":0.95}]"#);
        fixture.llm.push_text("no");

        fixture.orchestrator.on_message(&event("nice weather today")).await.unwrap();

        let instruction = fixture.emitter.last_instruction().unwrap();
        assert!(instruction.contains("empathic assistant"));
    }

    #[tokio::test]
    async fn ambiguous_intents_ask_for_goal_clarification() {
        let fixture = fixture(vec![]);
        fixture.llm.push_json(
            r#"[{"intent":"AddTask","confidence":0.8},{"intent":"SetReminder","confidence":0.8}]"#,
        );
        fixture.llm.push_text("no");

        fixture.orchestrator.on_message(&event("remember to call mom")).await.unwrap();

        let saved = fixture.contexts.load(&FriendshipId("f".into())).await.unwrap();
        assert!(saved.pending_goal_clarification());
        let instruction = fixture.emitter.last_instruction().unwrap();
        assert!(instruction.contains("- AddTask"));
        assert!(instruction.contains("- SetReminder"));
    }

    #[tokio::test]
    async fn stale_context_is_discarded() {
        let fixture = fixture(vec![Arc::new(ScriptedSubtaskHandler::clarifying(
            Intent::new("AddTask"),
            "Which list should it go on?",
        ))]);
        let mut old = GoalContext::none();
        old.goal = Some(Goal::new(Intent::new("SetReminder")));
        old.last_updated = Utc::now() - Duration::minutes(30);
        old.subtask_clarification_questions = vec![SubtaskClarificationQuestion {
            text: "When?".into(),
            related_subtask: crate::interaction::subtask::SubtaskId::raw("old"),
        }];
        fixture.contexts.seed(&FriendshipId("f".into()), old).await;

        // A fresh classification runs instead of resolving the stale question.
        fixture.llm.push_json(r#"[{"intent":"AddTask","confidence":0.9}]"#);
        fixture.llm.push_text("no");

        fixture.orchestrator.on_message(&event("add a task to call mom")).await.unwrap();

        let saved = fixture.contexts.load(&FriendshipId("f".into())).await.unwrap();
        assert_eq!(saved.goal, Some(Goal::new(Intent::new("AddTask"))));
        assert_eq!(saved.subtask_clarification_questions.len(), 1);
        assert_eq!(
            saved.subtask_clarification_questions[0].text,
            "Which list should it go on?"
        );
    }

    #[tokio::test]
    async fn resolved_goal_clarification_skips_reclassification() {
        let fixture = fixture(vec![Arc::new(ScriptedSubtaskHandler::completing(
            Intent::new("AddTask"),
            "Stored the task",
        ))]);
        let mut pending = GoalContext::none();
        pending.goal = Some(Goal::new(CoreIntents::unknown()));
        pending.goal_clarification_question =
            Some(crate::interaction::context::GoalClarificationQuestion {
                prompt: "Task or reminder?".into(),
                intents: [Intent::new("AddTask"), Intent::new("SetReminder")]
                    .into_iter()
                    .collect(),
            });
        fixture.contexts.seed(&FriendshipId("f".into()), pending).await;

        // Only the clarification-resolution call is scripted; a second
        // classification request would drain the script and fall to Unknown.
        fixture.llm.push_json(r#"{"isGoalClear": true, "intent": "AddTask"}"#);

        fixture.orchestrator.on_message(&event("a task please")).await.unwrap();

        let saved = fixture.contexts.load(&FriendshipId("f".into())).await.unwrap();
        assert!(saved.goal.is_none());
        assert!(saved.subtasks.is_empty());
        let instruction = fixture.emitter.last_instruction().unwrap();
        assert!(instruction.contains("Stored the task"));
    }

    #[tokio::test]
    async fn subtask_clarification_answer_advances_the_goal() {
        let handler = Arc::new(ScriptedSubtaskHandler::resolving(
            Intent::new("SetReminder"),
            "Reminder saved for tomorrow",
        ));
        let fixture = fixture(vec![handler]);

        let friendship = FriendshipId("f".into());
        let message = UserMessage::new(MessageId("m0".into()), Utc::now(), "remind me", Channel::Signal);
        let subtask = crate::interaction::subtask::Subtask::for_message(
            Intent::new("SetReminder"),
            "Store the reminder",
            &friendship,
            &message,
        )
        .with_status(SubtaskStatus::InClarification);
        let mut pending = GoalContext::none();
        pending.goal = Some(Goal::new(Intent::new("SetReminder")));
        pending.subtask_clarification_questions = vec![SubtaskClarificationQuestion {
            text: "When should I remind you?".into(),
            related_subtask: subtask.id.clone(),
        }];
        pending.subtasks = vec![subtask];
        pending.parameters = Params::new();
        fixture.contexts.seed(&friendship, pending).await;

        fixture.llm.push_text("no"); // abort check
        fixture.llm.push_json(r#"[{"intent":"SetReminder","confidence":0.9}]"#);
        fixture.llm.push_text("no"); // add-task check

        fixture.orchestrator.on_message(&event("tomorrow at 9")).await.unwrap();

        let saved = fixture.contexts.load(&friendship).await.unwrap();
        assert!(saved.goal.is_none());
        assert!(saved.subtasks.is_empty());
        assert!(saved.subtask_clarification_questions.is_empty());
        let instruction = fixture.emitter.last_instruction().unwrap();
        assert!(instruction.contains("Reminder saved for tomorrow"));
    }
}
