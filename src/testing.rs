//! Hand-rolled test doubles shared across unit and integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::interaction::context::GoalContext;
use crate::interaction::intent::Intent;
use crate::interaction::subtask::{
    Params, Subtask, SubtaskClarificationQuestion, SubtaskClarificationResult, SubtaskContributor,
    SubtaskHandler, SubtaskResult,
};
use crate::traits::{
    ChatMessage, ConversationLog, FriendshipLedger, GoalContextRepository, LanguageModel,
    ModelOptions, ResponseEmitter,
};
use crate::types::{
    Channel, Conversation, ConversationTurn, FriendshipId, MessageId, UserMessage,
};

/// Scripted language model. JSON and text prompts consume separate FIFO
/// queues; an empty queue answers `None`, like a provider outage would.
#[derive(Default)]
pub struct MockLanguageModel {
    json_responses: Mutex<VecDeque<String>>,
    text_responses: Mutex<VecDeque<String>>,
    fail_json: AtomicBool,
    prompts: Mutex<Vec<String>>,
}

impl MockLanguageModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_json(&self, response: &str) {
        self.json_responses.lock().unwrap().push_back(response.to_string());
    }

    pub fn push_text(&self, response: &str) {
        self.text_responses.lock().unwrap().push_back(response.to_string());
    }

    pub fn fail_json_calls(&self) {
        self.fail_json.store(true, Ordering::SeqCst);
    }

    /// Every prompt content sent so far, in call order.
    pub fn seen_prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    fn record(&self, messages: &[ChatMessage]) {
        let mut prompts = self.prompts.lock().unwrap();
        for message in messages {
            prompts.push(message.content.clone());
        }
    }
}

#[async_trait]
impl LanguageModel for MockLanguageModel {
    async fn prompt_for_json(
        &self,
        messages: &[ChatMessage],
        _options: &ModelOptions,
        _timezone: &str,
        _reference_time: DateTime<Utc>,
    ) -> Option<String> {
        self.record(messages);
        if self.fail_json.load(Ordering::SeqCst) {
            return None;
        }
        self.json_responses.lock().unwrap().pop_front()
    }

    async fn prompt_for_text(
        &self,
        messages: &[ChatMessage],
        _options: &ModelOptions,
        _timezone: &str,
        _reference_time: DateTime<Utc>,
    ) -> Option<String> {
        self.record(messages);
        self.text_responses.lock().unwrap().pop_front()
    }
}

/// Ledger answering the same timezone for every friendship.
pub struct StaticLedger {
    timezone: String,
}

impl StaticLedger {
    pub fn utc() -> Self {
        Self {
            timezone: "UTC".to_string(),
        }
    }

    pub fn with_timezone(timezone: &str) -> Self {
        Self {
            timezone: timezone.to_string(),
        }
    }
}

#[async_trait]
impl FriendshipLedger for StaticLedger {
    async fn timezone_of(&self, _friendship_id: &FriendshipId) -> String {
        self.timezone.clone()
    }
}

enum ScriptedBehavior {
    Complete,
    Clarify(String),
}

/// Subtask handler with a fixed reaction, for driving the achiever and
/// orchestrator without real extraction logic.
pub struct ScriptedSubtaskHandler {
    intent: Intent,
    behavior: ScriptedBehavior,
    success_prompt: Option<String>,
    parameters: Params,
}

impl ScriptedSubtaskHandler {
    /// Completes every subtask with the given success prompt.
    pub fn completing(intent: Intent, success_prompt: &str) -> Self {
        Self {
            intent,
            behavior: ScriptedBehavior::Complete,
            success_prompt: Some(success_prompt.to_string()),
            parameters: Params::new(),
        }
    }

    pub fn completing_with_parameters(
        intent: Intent,
        success_prompt: &str,
        parameters: Params,
    ) -> Self {
        Self {
            intent,
            behavior: ScriptedBehavior::Complete,
            success_prompt: Some(success_prompt.to_string()),
            parameters,
        }
    }

    /// Always asks the given clarification question.
    pub fn clarifying(intent: Intent, question: &str) -> Self {
        Self {
            intent,
            behavior: ScriptedBehavior::Clarify(question.to_string()),
            success_prompt: None,
            parameters: Params::new(),
        }
    }

    /// Alias for handlers exercised through the clarification path.
    pub fn resolving(intent: Intent, success_prompt: &str) -> Self {
        Self::completing(intent, success_prompt)
    }
}

#[async_trait]
impl SubtaskHandler for ScriptedSubtaskHandler {
    fn can_handle(&self, intent: &Intent) -> bool {
        *intent == self.intent
    }

    async fn handle(
        &self,
        subtask: &Subtask,
        _context: &GoalContext,
        _friendship_id: &FriendshipId,
    ) -> SubtaskResult {
        match &self.behavior {
            ScriptedBehavior::Complete => SubtaskResult::success(
                subtask.clone(),
                self.success_prompt.clone(),
                self.parameters.clone(),
            ),
            ScriptedBehavior::Clarify(question) => {
                SubtaskResult::needs_clarification(subtask.clone(), question.clone(), None)
            }
        }
    }

    async fn try_resolve_clarification(
        &self,
        subtask: &Subtask,
        _question: &SubtaskClarificationQuestion,
        _answer: &UserMessage,
        _context: &GoalContext,
        _friendship_id: &FriendshipId,
    ) -> SubtaskClarificationResult {
        match &self.behavior {
            ScriptedBehavior::Complete => SubtaskClarificationResult::success(
                subtask.clone(),
                self.success_prompt.clone(),
                self.parameters.clone(),
            ),
            ScriptedBehavior::Clarify(question) => {
                SubtaskClarificationResult::needs_clarification(subtask.clone(), question.clone())
            }
        }
    }
}

/// Contributor that derives one subtask per message.
pub struct StaticSubtaskContributor {
    intent: Intent,
    description: String,
}

impl StaticSubtaskContributor {
    pub fn new(intent: Intent, description: &str) -> Self {
        Self {
            intent,
            description: description.to_string(),
        }
    }
}

impl SubtaskContributor for StaticSubtaskContributor {
    fn for_intent(&self) -> Intent {
        self.intent.clone()
    }

    fn provide_subtasks(
        &self,
        intent: &Intent,
        friendship_id: &FriendshipId,
        message: &UserMessage,
    ) -> Vec<Subtask> {
        vec![Subtask::for_message(
            intent.clone(),
            self.description.clone(),
            friendship_id,
            message,
        )]
    }
}

/// In-memory context store.
#[derive(Default)]
pub struct InMemoryGoalContexts {
    contexts: Mutex<HashMap<FriendshipId, GoalContext>>,
}

impl InMemoryGoalContexts {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed(&self, friendship_id: &FriendshipId, context: GoalContext) {
        self.contexts
            .lock()
            .unwrap()
            .insert(friendship_id.clone(), context);
    }

    pub async fn load(&self, friendship_id: &FriendshipId) -> Option<GoalContext> {
        self.contexts.lock().unwrap().get(friendship_id).cloned()
    }
}

#[async_trait]
impl GoalContextRepository for InMemoryGoalContexts {
    async fn load_context(&self, friendship_id: &FriendshipId) -> anyhow::Result<Option<GoalContext>> {
        Ok(self.contexts.lock().unwrap().get(friendship_id).cloned())
    }

    async fn save_context(
        &self,
        friendship_id: &FriendshipId,
        context: &GoalContext,
    ) -> anyhow::Result<()> {
        self.contexts
            .lock()
            .unwrap()
            .insert(friendship_id.clone(), context.clone());
        Ok(())
    }
}

#[derive(Default)]
struct ConversationState {
    current: Option<Conversation>,
    ended: bool,
}

/// In-memory conversation log.
#[derive(Default)]
pub struct InMemoryConversationLog {
    state: Mutex<HashMap<FriendshipId, ConversationState>>,
}

impl InMemoryConversationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn conversation_ended(&self, friendship_id: &FriendshipId) -> bool {
        self.state
            .lock()
            .unwrap()
            .get(friendship_id)
            .map(|s| s.ended)
            .unwrap_or(false)
    }
}

#[async_trait]
impl ConversationLog for InMemoryConversationLog {
    async fn append_user_message(
        &self,
        friendship_id: &FriendshipId,
        message: &UserMessage,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state.entry(friendship_id.clone()).or_default();
        if let Some(conversation) = &mut entry.current {
            conversation.turns.push(ConversationTurn {
                from_user: true,
                text: message.text.clone(),
                created_at: message.received_at,
            });
        }
        Ok(())
    }

    async fn current_conversation(
        &self,
        friendship_id: &FriendshipId,
    ) -> anyhow::Result<Option<Conversation>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .get(friendship_id)
            .and_then(|s| s.current.clone()))
    }

    async fn start_conversation(
        &self,
        friendship_id: &FriendshipId,
        _intent: &Intent,
        message: &UserMessage,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state.entry(friendship_id.clone()).or_default();
        entry.current = Some(Conversation {
            turns: vec![ConversationTurn {
                from_user: true,
                text: message.text.clone(),
                created_at: message.received_at,
            }],
        });
        entry.ended = false;
        Ok(())
    }

    async fn end_conversation(&self, friendship_id: &FriendshipId) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state.entry(friendship_id.clone()).or_default();
        entry.current = None;
        entry.ended = true;
        Ok(())
    }
}

/// Records every emitted response instruction.
#[derive(Default)]
pub struct RecordingEmitter {
    emitted: Mutex<Vec<(FriendshipId, Channel, String, MessageId)>>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_instruction(&self) -> Option<String> {
        self.emitted
            .lock()
            .unwrap()
            .last()
            .map(|(_, _, instruction, _)| instruction.clone())
    }

    pub fn emitted_count(&self) -> usize {
        self.emitted.lock().unwrap().len()
    }
}

#[async_trait]
impl ResponseEmitter for RecordingEmitter {
    async fn emit(
        &self,
        friendship_id: &FriendshipId,
        channel: Channel,
        instruction: &str,
        in_reply_to: &MessageId,
    ) -> anyhow::Result<()> {
        self.emitted.lock().unwrap().push((
            friendship_id.clone(),
            channel,
            instruction.to_string(),
            in_reply_to.clone(),
        ));
        Ok(())
    }
}
