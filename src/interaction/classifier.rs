use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::interaction::intent::{CoreIntents, Intent, IntentRegistry};
use crate::traits::{ChatMessage, LanguageModel, ModelOptions};
use crate::types::{Conversation, UserMessage};

/// One ranked classification.
#[derive(Debug, Clone, PartialEq)]
pub struct IntentClassification {
    pub intent: Intent,
    pub confidence: f32,
}

/// Classifies a message or conversation into a ranked list of intents by
/// delegating to the language model.
///
/// Never fails: any LLM or parse error yields `[Unknown @ 0.0]`. The primary
/// pass is tuned for recall; a secondary yes/no pass corrects a known
/// false-negative pattern for bare task-add instructions by force-ranking the
/// add-task intent at 1.0.
pub struct IntentClassifier {
    llm: Arc<dyn LanguageModel>,
    intent_registry: Arc<IntentRegistry>,
    default_model: String,
    precision_model: String,
    add_task_intent: Intent,
}

impl IntentClassifier {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        intent_registry: Arc<IntentRegistry>,
        default_model: impl Into<String>,
        precision_model: impl Into<String>,
        add_task_intent: Intent,
    ) -> Self {
        Self {
            llm,
            intent_registry,
            default_model: default_model.into(),
            precision_model: precision_model.into(),
            add_task_intent,
        }
    }

    /// Classify based on the tracked conversation, focusing on its last turn.
    pub async fn classify_conversation(
        &self,
        conversation: &Conversation,
        message: &UserMessage,
    ) -> Vec<IntentClassification> {
        let prompt = format!(
            "Based on the final user message, identify the user's actual *intention or goal* \
             (not just keywords or content). Classify into one of the following intents:\n\
             {intents}\n\n\
             Completely ignore intents at the beginning of the conversation. Focus on the last message.\n\n\
             Return a JSON array of objects with 'intent' and 'confidence' fields.\n\
             Example:\n\
             [\n  {{ \"intent\": \"<intent>\", \"confidence\": 0.8 }},\n  {{ \"intent\": \"<intent>\", \"confidence\": 0.05 }}\n]\n\n\
             Conversation:\n{transcript}",
            intents = self.intent_descriptions(),
            transcript = conversation.transcript(),
        );
        self.classify(message, prompt).await
    }

    /// Classify a bare message with no conversation history.
    pub async fn classify_message(&self, message: &UserMessage) -> Vec<IntentClassification> {
        let prompt = format!(
            "Classify the user's message into one of the following intents:\n\
             {intents}\n\n\
             User message:\n \"{text}\"\n---\n\n\
             Return a JSON array of objects with 'intent' and 'confidence' fields.\n\
             Example:\n\
             [\n  {{ \"intent\": \"<intent>\", \"confidence\": 0.8 }},\n  {{ \"intent\": \"<intent>\", \"confidence\": 0.05 }}\n]",
            intents = self.intent_descriptions(),
            text = message.text,
        );
        self.classify(message, prompt).await
    }

    async fn classify(&self, message: &UserMessage, prompt: String) -> Vec<IntentClassification> {
        // Both LLM passes are independent round trips; run them concurrently.
        let (ranked, add_task_is_clearly_intended) = tokio::join!(
            self.ranked_classification(prompt),
            self.verify_add_task_intended(message),
        );

        if !add_task_is_clearly_intended {
            ranked
        } else {
            let mut overridden: Vec<_> = ranked
                .into_iter()
                .filter(|c| c.intent != self.add_task_intent)
                .collect();
            overridden.push(IntentClassification {
                intent: self.add_task_intent.clone(),
                confidence: 1.0,
            });
            overridden.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
            overridden
        }
    }

    async fn ranked_classification(&self, prompt: String) -> Vec<IntentClassification> {
        let response = self
            .llm
            .prompt_for_json(
                &[ChatMessage::user(prompt)],
                &ModelOptions::deterministic(&self.default_model).with_top_p(0.3),
                "UTC",
                Utc::now(),
            )
            .await
            .unwrap_or_else(|| "[]".to_string());

        match Self::parse_classification(&response, &self.intent_registry) {
            Some(ranked) if !ranked.is_empty() => ranked,
            _ => {
                debug!("Intent classification unparseable, falling back to Unknown");
                vec![IntentClassification {
                    intent: CoreIntents::unknown(),
                    confidence: 0.0,
                }]
            }
        }
    }

    async fn verify_add_task_intended(&self, message: &UserMessage) -> bool {
        let prompt = format!(
            "Does the user **clearly and explicitly** want to add a task to their task list?\n\n\
             Return only:\n\
             - yes -> if the user gives a clear instruction to create a task (e.g. \"Add a task to call the clinic\")\n\
             - no -> in all other cases, including vague, indirect, or reminder-like expressions\n\n\
             The user's message:\n\"{}\"\n\n\
             Answer only: yes or no",
            message.text
        );
        self.llm
            .prompt_for_text(
                &[ChatMessage::user(prompt)],
                &ModelOptions::deterministic(&self.precision_model).with_top_p(0.7),
                "UTC",
                message.received_at,
            )
            .await
            .map(|answer| answer.trim().to_lowercase().starts_with("yes"))
            .unwrap_or(false)
    }

    fn intent_descriptions(&self) -> String {
        self.intent_registry
            .get_descriptions()
            .iter()
            .map(|(intent, description)| format!("- \"{}\": {}", intent.name(), description))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn parse_classification(
        response: &str,
        registry: &IntentRegistry,
    ) -> Option<Vec<IntentClassification>> {
        let parsed: Value = serde_json::from_str(response).ok()?;
        let items = parsed.as_array()?;
        let mut ranked: Vec<IntentClassification> = items
            .iter()
            .filter_map(|item| {
                let name = item.get("intent")?.as_str()?;
                let confidence = item
                    .get("confidence")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0) as f32;
                Some(IntentClassification {
                    intent: registry.resolve(name),
                    confidence,
                })
            })
            .collect();
        ranked.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Some(ranked)
    }
}
