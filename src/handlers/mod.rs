//! Domain subtask handlers: tasks, reminders and timers, each wired over the
//! generic CRUD machinery in `interaction::crud`.

pub mod reminders;
pub mod tasks;
pub mod timers;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::interaction::crud::{ClarificationExchange, IdResolution};
use crate::interaction::intent::{Intent, IntentContributor};
use crate::interaction::subtask::{Subtask, SubtaskContributor};
use crate::traits::{ChatMessage, LanguageModel, ModelOptions};
use crate::types::{FriendshipId, UserMessage};

/// Intent contributor with a fixed name and description.
pub struct StaticIntentContributor {
    intent: Intent,
    description: &'static str,
}

impl StaticIntentContributor {
    pub fn new(intent: Intent, description: &'static str) -> Self {
        Self { intent, description }
    }
}

impl IntentContributor for StaticIntentContributor {
    fn intent(&self) -> Intent {
        self.intent.clone()
    }

    fn description(&self) -> String {
        self.description.to_string()
    }
}

/// Subtask contributor deriving one subtask per message, carrying the raw
/// message text for later extraction.
pub struct MessageSubtaskContributor {
    intent: Intent,
    description_prefix: &'static str,
}

impl MessageSubtaskContributor {
    pub fn new(intent: Intent, description_prefix: &'static str) -> Self {
        Self {
            intent,
            description_prefix,
        }
    }
}

impl SubtaskContributor for MessageSubtaskContributor {
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
            format!("{}: {}", self.description_prefix, truncate(&message.text, 40)),
            friendship_id,
            message,
        )]
    }
}

pub fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Appends the clarification question and answer to the conversation section
/// of an extraction prompt.
pub fn conversation_block(raw_text: &str, exchange: Option<&ClarificationExchange>) -> String {
    match exchange {
        Some(exchange) => format!(
            "\"{raw_text}\"\n---\n\"{}\"\n---\n\"{}\"",
            exchange.question, exchange.answer
        ),
        None => format!("\"{raw_text}\""),
    }
}

/// Asks the model which stored entity the user refers to. The user never
/// sees ids, so ambiguity comes back as a clarifying question instead.
#[allow(clippy::too_many_arguments)]
pub async fn identify_entity_with_llm(
    llm: &dyn LanguageModel,
    model: &str,
    action: &str,
    entity_name: &str,
    entity_list_text: &str,
    raw_text: &str,
    exchange: Option<&ClarificationExchange>,
    timezone: &str,
    message_time: DateTime<Utc>,
) -> IdResolution {
    let prompt = format!(
        "You are helping to identify which {entity_name} the user wants to {action}.\n\n\
         You are given:\n\
         - a list of {entity_name} entries\n\
         - a user message\n\
         - optional clarification follow-ups\n\n\
         Select the single {entity_name} to {action} based on user intent.\n\n\
         If there's only one matching {entity_name}, return its ID.\n\
         If multiple match equally well, return a clarifying question.\n\
         If no good match exists, return an empty JSON object.\n\n\
         User does not know IDs. Never include explanations.\n\n\
         Return JSON like:\n\
         {{\n  \"id\": \"...\",\n  \"clarifyingQuestion\": \"...\"\n}}\n\n\
         {entity_name} list:\n{entity_list_text}\n\n\
         Conversation:\n{conversation}",
        conversation = conversation_block(raw_text, exchange),
    );

    let response = llm
        .prompt_for_json(
            &[ChatMessage::user(prompt)],
            &ModelOptions::deterministic(model).with_top_p(0.8),
            timezone,
            message_time,
        )
        .await;
    let parsed: Option<Value> = response.and_then(|r| serde_json::from_str(&r).ok());
    match parsed {
        Some(json) => IdResolution::Clarified {
            id: json
                .get("id")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            clarifying_question: json
                .get("clarifyingQuestion")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        },
        None => IdResolution::Clarified {
            id: None,
            clarifying_question: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockLanguageModel;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 40), "hello");
        assert_eq!(truncate("hello world", 5), "hello");
        assert_eq!(truncate("käsekuchen", 2), "kä");
    }

    #[test]
    fn conversation_block_includes_exchange() {
        let block = conversation_block(
            "remove the reminder",
            Some(&ClarificationExchange {
                question: "Which one?".into(),
                answer: "the cat one".into(),
            }),
        );
        assert!(block.contains("remove the reminder"));
        assert!(block.contains("Which one?"));
        assert!(block.contains("the cat one"));
    }

    #[tokio::test]
    async fn identification_degrades_on_provider_failure() {
        let llm = MockLanguageModel::new();
        llm.fail_json_calls();

        let resolution = identify_entity_with_llm(
            &llm,
            "model",
            "remove",
            "reminder",
            "- feed the cat, id=1",
            "remove it",
            None,
            "UTC",
            Utc::now(),
        )
        .await;

        assert!(resolution.needs_clarification());
        assert!(resolution.id().is_none());
    }
}
