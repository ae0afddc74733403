use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use crate::channels::SignalSender;
use crate::traits::{
    ChatMessage, ConversationLog, FriendshipLedger, LanguageModel, ModelOptions, ResponseEmitter,
};
use crate::types::{Channel, FriendshipId, MessageId};

const RESPONSE_TEMPERATURE: f32 = 0.3;

const FALLBACK_TEXT: &str =
    "I'm having trouble finding the right words right now. Please try again in a moment.";

/// Delivery seam between response generation and the wire. `SignalSender`
/// is the production implementation.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn deliver(&self, recipient: &str, text: &str) -> anyhow::Result<()>;
}

#[async_trait]
impl MessageSink for SignalSender {
    async fn deliver(&self, recipient: &str, text: &str) -> anyhow::Result<()> {
        self.send_message(recipient, text).await
    }
}

/// Renders response instructions into friend-facing text and sends them.
///
/// The orchestrator never phrases messages itself; it emits instructions like
/// "Tell the user the intent AddTask succeeded...". This is where those
/// become actual chat messages, with the recent conversation as context.
pub struct SignalResponder {
    llm: Arc<dyn LanguageModel>,
    sink: Arc<dyn MessageSink>,
    friendship_ledger: Arc<dyn FriendshipLedger>,
    conversation_log: Arc<dyn ConversationLog>,
    model: String,
}

impl SignalResponder {
    pub fn new(
        llm: Arc<dyn LanguageModel>,
        sink: Arc<dyn MessageSink>,
        friendship_ledger: Arc<dyn FriendshipLedger>,
        conversation_log: Arc<dyn ConversationLog>,
        model: &str,
    ) -> Self {
        Self {
            llm,
            sink,
            friendship_ledger,
            conversation_log,
            model: model.to_string(),
        }
    }

    async fn render(&self, friendship_id: &FriendshipId, instruction: &str) -> String {
        let system = "You are an empathic assistant for neurodivergent people, chatting over Signal.\n\
             You write short, kind, concrete messages. No markdown headers, no bullet-point walls.\n\
             You will receive a description of the message to write. Write that message in the \
             language the friend uses. Answer with the message only, no explanation.";

        let mut prompt = String::new();
        match self.conversation_log.current_conversation(friendship_id).await {
            Ok(Some(conversation)) if !conversation.is_empty() => {
                prompt.push_str("Current conversation:\n");
                prompt.push_str(&conversation.transcript());
                prompt.push_str("\n---\n");
            }
            Ok(_) => {}
            Err(err) => warn!("Loading conversation for response generation failed: {err}"),
        }
        prompt.push_str("Write a message based on this description:\n");
        prompt.push_str(instruction);

        let timezone = self.friendship_ledger.timezone_of(friendship_id).await;
        let options = ModelOptions {
            model: self.model.clone(),
            temperature: RESPONSE_TEMPERATURE,
            top_p: None,
        };
        let rendered = self
            .llm
            .prompt_for_text(
                &[ChatMessage::system(system), ChatMessage::user(prompt)],
                &options,
                &timezone,
                Utc::now(),
            )
            .await
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty());

        match rendered {
            Some(text) => text,
            None => {
                warn!(friendship_id = %friendship_id, "Response generation failed, sending fallback");
                FALLBACK_TEXT.to_string()
            }
        }
    }
}

#[async_trait]
impl ResponseEmitter for SignalResponder {
    async fn emit(
        &self,
        friendship_id: &FriendshipId,
        channel: Channel,
        instruction: &str,
        in_reply_to: &MessageId,
    ) -> anyhow::Result<()> {
        debug!(friendship_id = %friendship_id, ?channel, in_reply_to = %in_reply_to, "Emitting response");
        let text = self.render(friendship_id, instruction).await;
        self.sink.deliver(&friendship_id.0, &text).await
    }
}
