use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::handlers::{
    conversation_block, identify_entity_with_llm, MessageSubtaskContributor,
    StaticIntentContributor,
};
use crate::interaction::context::GoalContext;
use crate::interaction::crud::{
    ClarificationExchange, CrudEntityHandler, CrudSubtaskHandler, EntitySource, ExtractionResult,
    IdResolution,
};
use crate::interaction::intent::{Intent, IntentContributor};
use crate::interaction::subtask::{
    Params, Subtask, SubtaskClarificationQuestion, SubtaskClarificationResult, SubtaskContributor,
    SubtaskHandler, SubtaskResult,
};
use crate::traits::{ChatMessage, FriendshipLedger, LanguageModel, ModelOptions};
use crate::types::{FriendshipId, UserMessage};

pub struct TimerIntents;

impl TimerIntents {
    pub fn set() -> Intent {
        Intent::new("SetTimer")
    }
    pub fn list() -> Intent {
        Intent::new("ListTimers")
    }
    pub fn remove() -> Intent {
        Intent::new("RemoveTimer")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timer {
    pub id: String,
    pub label: Option<String>,
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimerDraft {
    pub duration: Option<Duration>,
    pub label: Option<String>,
}

#[async_trait]
pub trait TimerStore: Send + Sync {
    async fn timers_of(&self, friendship_id: &FriendshipId) -> anyhow::Result<Vec<Timer>>;
    async fn start_timer(
        &self,
        friendship_id: &FriendshipId,
        label: Option<&str>,
        duration: Duration,
    ) -> anyhow::Result<Timer>;
    async fn remove_timer(&self, friendship_id: &FriendshipId, id: &str) -> anyhow::Result<()>;
}

/// Accepts an ISO 8601 duration like "PT1H30M" or a bare number of minutes.
fn parse_duration(raw: &str) -> Option<Duration> {
    let trimmed = raw.trim();
    if let Ok(minutes) = trimmed.parse::<u64>() {
        return Some(Duration::from_secs(minutes * 60));
    }
    let upper = trimmed.to_ascii_uppercase();
    let body = upper.strip_prefix("PT").or_else(|| upper.strip_prefix("P"))?;
    let mut total_secs = 0u64;
    let mut number = String::new();
    for ch in body.chars() {
        if ch.is_ascii_digit() {
            number.push(ch);
            continue;
        }
        let value = number.parse::<u64>().ok()?;
        number.clear();
        total_secs += match ch {
            'H' => value * 3600,
            'M' => value * 60,
            'S' => value,
            _ => return None,
        };
    }
    if !number.is_empty() || total_secs == 0 {
        return None;
    }
    Some(Duration::from_secs(total_secs))
}

fn human_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

fn timer_list_text(timers: &[Timer]) -> String {
    timers
        .iter()
        .map(|t| {
            format!(
                "- label: {}, duration: {}, id={}",
                t.label.as_deref().unwrap_or("(none)"),
                human_duration(t.duration),
                t.id
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

struct SetTimerEntityHandler {
    llm: Arc<dyn LanguageModel>,
    model: String,
}

#[async_trait]
impl CrudEntityHandler<TimerDraft, Timer> for SetTimerEntityHandler {
    async fn extract_entity_data(
        &self,
        raw_text: &str,
        previous_data: Option<&TimerDraft>,
        exchange: Option<&ClarificationExchange>,
        _friendship_id: &FriendshipId,
        timezone: &str,
        message_time: DateTime<Utc>,
    ) -> ExtractionResult<TimerDraft> {
        let prompt = format!(
            "You are helping the user set a timer.\n\n\
             A timer needs:\n\
             - duration (required): how long to wait before the timer rings. ISO 8601 duration format or number of minutes.\n\
             - label (optional): what the timer is for.\n\n\
             This is a multi-turn conversation. You may get partial information. Missing fields will be asked later.\n\
             Only extract values the user clearly states. Do NOT guess or invent.\n\n\
             Return valid JSON:\n\
             {{\n  \"duration\": \"PT15M\",\n  \"label\": \"cook pasta\"\n}}\n\n\
             Conversation:\n{}",
            conversation_block(raw_text, exchange),
        );
        let response = self
            .llm
            .prompt_for_json(
                &[ChatMessage::user(prompt)],
                &ModelOptions::deterministic(&self.model).with_top_p(0.8),
                timezone,
                message_time,
            )
            .await;
        let json: Option<Value> = response.and_then(|r| serde_json::from_str(&r).ok());
        let json = match json {
            Some(json) => json,
            None => return ExtractionResult::incomplete(None, vec!["duration".into()], None),
        };

        let duration = json
            .get("duration")
            .and_then(Value::as_str)
            .and_then(parse_duration)
            .or_else(|| previous_data.and_then(|p| p.duration));
        let label = json
            .get("label")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .or_else(|| previous_data.and_then(|p| p.label.clone()));

        match duration {
            Some(duration) => {
                let message = format!("Started a {} timer", human_duration(duration));
                ExtractionResult::complete(
                    TimerDraft {
                        duration: Some(duration),
                        label,
                    },
                    Some(message),
                )
            }
            None => ExtractionResult::incomplete(
                Some(TimerDraft {
                    duration: None,
                    label,
                }),
                vec!["duration".into()],
                Some("How long should the timer run?".into()),
            ),
        }
    }

    async fn identify_entity_id(
        &self,
        _all_entities: &[Timer],
        _raw_text: &str,
        _exchange: Option<&ClarificationExchange>,
        _friendship_id: &FriendshipId,
        _timezone: &str,
        _message_time: DateTime<Utc>,
    ) -> IdResolution {
        IdResolution::NotNeeded { id: None }
    }
}

struct RemoveTimerEntityHandler {
    llm: Arc<dyn LanguageModel>,
    model: String,
}

#[async_trait]
impl CrudEntityHandler<TimerDraft, Timer> for RemoveTimerEntityHandler {
    async fn extract_entity_data(
        &self,
        _raw_text: &str,
        _previous_data: Option<&TimerDraft>,
        _exchange: Option<&ClarificationExchange>,
        _friendship_id: &FriendshipId,
        _timezone: &str,
        _message_time: DateTime<Utc>,
    ) -> ExtractionResult<TimerDraft> {
        ExtractionResult::complete(TimerDraft::default(), Some("Cancelled the timer".to_string()))
    }

    async fn identify_entity_id(
        &self,
        all_entities: &[Timer],
        raw_text: &str,
        exchange: Option<&ClarificationExchange>,
        _friendship_id: &FriendshipId,
        timezone: &str,
        message_time: DateTime<Utc>,
    ) -> IdResolution {
        if let [only] = all_entities {
            return IdResolution::Clarified {
                id: Some(only.id.clone()),
                clarifying_question: None,
            };
        }
        identify_entity_with_llm(
            self.llm.as_ref(),
            &self.model,
            "cancel",
            "timer",
            &timer_list_text(all_entities),
            raw_text,
            exchange,
            timezone,
            message_time,
        )
        .await
    }
}

struct StartTimerSource {
    store: Arc<dyn TimerStore>,
}

#[async_trait]
impl EntitySource<TimerDraft, Timer> for StartTimerSource {
    async fn load_entities(&self, _friendship_id: &FriendshipId) -> anyhow::Result<Vec<Timer>> {
        Ok(vec![])
    }

    async fn apply_update(
        &self,
        friendship_id: &FriendshipId,
        _id: Option<&str>,
        entity: TimerDraft,
    ) -> anyhow::Result<()> {
        let duration = match entity.duration {
            Some(duration) => duration,
            None => anyhow::bail!("duration is mandatory"),
        };
        self.store
            .start_timer(friendship_id, entity.label.as_deref(), duration)
            .await?;
        Ok(())
    }
}

struct RemoveTimerSource {
    store: Arc<dyn TimerStore>,
}

#[async_trait]
impl EntitySource<TimerDraft, Timer> for RemoveTimerSource {
    async fn load_entities(&self, friendship_id: &FriendshipId) -> anyhow::Result<Vec<Timer>> {
        self.store.timers_of(friendship_id).await
    }

    async fn apply_update(
        &self,
        friendship_id: &FriendshipId,
        id: Option<&str>,
        _entity: TimerDraft,
    ) -> anyhow::Result<()> {
        match id {
            Some(id) => self.store.remove_timer(friendship_id, id).await,
            None => anyhow::bail!("timer removal without id"),
        }
    }
}

struct ListTimersHandler {
    store: Arc<dyn TimerStore>,
}

#[async_trait]
impl SubtaskHandler for ListTimersHandler {
    fn can_handle(&self, intent: &Intent) -> bool {
        *intent == TimerIntents::list()
    }

    async fn handle(
        &self,
        subtask: &Subtask,
        _context: &GoalContext,
        friendship_id: &FriendshipId,
    ) -> SubtaskResult {
        let timers = match self.store.timers_of(friendship_id).await {
            Ok(timers) => timers,
            Err(err) => {
                return SubtaskResult::failure(&format!("Loading timers failed: {err}"), subtask.clone())
            }
        };
        let prompt = if timers.is_empty() {
            "Tell the user no timers are running.".to_string()
        } else {
            let listing = timers
                .iter()
                .map(|t| {
                    format!(
                        "- {} ({}, started at {})",
                        t.label.as_deref().unwrap_or("timer"),
                        human_duration(t.duration),
                        t.started_at.format("%H:%M"),
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            format!("Show the user their running timers:\n{listing}")
        };
        SubtaskResult::success(subtask.clone(), Some(prompt), Params::new())
    }

    async fn try_resolve_clarification(
        &self,
        subtask: &Subtask,
        _question: &SubtaskClarificationQuestion,
        _answer: &UserMessage,
        _context: &GoalContext,
        _friendship_id: &FriendshipId,
    ) -> SubtaskClarificationResult {
        SubtaskClarificationResult::success(subtask.clone(), None, Params::new())
    }
}

pub fn intent_contributors() -> Vec<Box<dyn IntentContributor>> {
    vec![
        Box::new(StaticIntentContributor::new(TimerIntents::set(), "Start a new timer")),
        Box::new(StaticIntentContributor::new(TimerIntents::list(), "List active timers")),
        Box::new(StaticIntentContributor::new(TimerIntents::remove(), "Cancel a timer")),
    ]
}

pub fn subtask_contributors() -> Vec<Arc<dyn SubtaskContributor>> {
    vec![
        Arc::new(MessageSubtaskContributor::new(TimerIntents::set(), "Set timer")),
        Arc::new(MessageSubtaskContributor::new(TimerIntents::list(), "List timers")),
        Arc::new(MessageSubtaskContributor::new(TimerIntents::remove(), "Remove timer")),
    ]
}

pub fn subtask_handlers(
    llm: Arc<dyn LanguageModel>,
    store: Arc<dyn TimerStore>,
    ledger: Arc<dyn FriendshipLedger>,
    model: &str,
) -> Vec<Arc<dyn SubtaskHandler>> {
    vec![
        Arc::new(CrudSubtaskHandler::new(
            TimerIntents::set(),
            Arc::new(SetTimerEntityHandler {
                llm: llm.clone(),
                model: model.to_string(),
            }),
            Arc::new(StartTimerSource { store: store.clone() }),
            ledger.clone(),
        )
        .with_data_question("How long should the timer run?")),
        Arc::new(CrudSubtaskHandler::new(
            TimerIntents::remove(),
            Arc::new(RemoveTimerEntityHandler {
                llm,
                model: model.to_string(),
            }),
            Arc::new(RemoveTimerSource { store: store.clone() }),
            ledger,
        )
        .with_id_question("Which timer should be cancelled?")),
        Arc::new(ListTimersHandler { store }),
    ]
}
