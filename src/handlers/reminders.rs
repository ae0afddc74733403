use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
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

pub struct ReminderIntents;

impl ReminderIntents {
    pub fn set() -> Intent {
        Intent::new("SetReminder")
    }
    pub fn list() -> Intent {
        Intent::new("ListReminders")
    }
    pub fn update() -> Intent {
        Intent::new("UpdateReminder")
    }
    pub fn remove() -> Intent {
        Intent::new("RemoveReminder")
    }
}

/// A stored time-based reminder. `remind_at` is kept in UTC and rendered in
/// the friend's timezone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reminder {
    pub id: String,
    pub text: String,
    pub remind_at: DateTime<Utc>,
}

/// Fields extracted from the conversation so far. Both are required to set a
/// reminder; for updates, absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReminderDraft {
    pub text: Option<String>,
    pub remind_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ReminderStore: Send + Sync {
    async fn reminders_of(&self, friendship_id: &FriendshipId) -> anyhow::Result<Vec<Reminder>>;
    async fn set_reminder(
        &self,
        friendship_id: &FriendshipId,
        text: &str,
        remind_at: DateTime<Utc>,
    ) -> anyhow::Result<Reminder>;
    async fn update_reminder(
        &self,
        friendship_id: &FriendshipId,
        id: &str,
        changes: &ReminderDraft,
    ) -> anyhow::Result<()>;
    async fn remove_reminder(&self, friendship_id: &FriendshipId, id: &str) -> anyhow::Result<()>;
}

fn parse_timezone(timezone: &str) -> Tz {
    timezone.parse().unwrap_or(chrono_tz::UTC)
}

/// Models answer with a local datetime, with or without seconds. Resolve it
/// in the friend's timezone.
fn parse_local_datetime(raw: &str, timezone: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim().trim_end_matches('Z');
    let naive = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M"))
        .ok()?;
    parse_timezone(timezone)
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

fn reminder_list_text(reminders: &[Reminder], timezone: &str) -> String {
    let tz = parse_timezone(timezone);
    reminders
        .iter()
        .map(|r| {
            format!(
                "- text: {}, remindAt: {}, id={}",
                r.text,
                r.remind_at.with_timezone(&tz).format("%Y-%m-%d %H:%M"),
                r.id
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

struct SetReminderEntityHandler {
    llm: Arc<dyn LanguageModel>,
    model: String,
}

#[async_trait]
impl CrudEntityHandler<ReminderDraft, Reminder> for SetReminderEntityHandler {
    async fn extract_entity_data(
        &self,
        raw_text: &str,
        previous_data: Option<&ReminderDraft>,
        exchange: Option<&ClarificationExchange>,
        _friendship_id: &FriendshipId,
        timezone: &str,
        message_time: DateTime<Utc>,
    ) -> ExtractionResult<ReminderDraft> {
        let system = "You are resolving the parameters of a TIME-BASED REMINDER request.\n\
             The user wants to be reminded at a specific future time (e.g., \"tomorrow at 2pm\", \"November 20 at 9am\").\n\n\
             Determine the future datetime to remind the user at and the reminder text.\n\
             You MUST NOT guess weekdays or dates. Resolve relative dates against the message's sending time.\n\n\
             Output JSON with:\n\
             - text: the message to show when reminding\n\
             - remindAt: an ISO 8601 datetime, e.g., 2042-01-21T12:30\n\
             Only output a valid JSON object with the required fields. NO explanation.";
        let prompt = format!(
            "Determine datetime and text for my reminder.\n\n\
             Conversation:\n{}",
            conversation_block(raw_text, exchange),
        );
        let response = self
            .llm
            .prompt_for_json(
                &[ChatMessage::system(system), ChatMessage::user(prompt)],
                &ModelOptions::deterministic(&self.model).with_top_p(0.8),
                timezone,
                message_time,
            )
            .await;
        let json: Option<Value> = response.and_then(|r| serde_json::from_str(&r).ok());
        let json = match json {
            Some(json) => json,
            None => {
                return ExtractionResult::incomplete(
                    None,
                    vec!["text".into(), "remindAt".into()],
                    None,
                )
            }
        };

        let text = json
            .get("text")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .or_else(|| previous_data.and_then(|p| p.text.clone()));
        let remind_at = json
            .get("remindAt")
            .and_then(Value::as_str)
            .and_then(|raw| parse_local_datetime(raw, timezone))
            .or_else(|| previous_data.and_then(|p| p.remind_at));

        let mut missing = vec![];
        if text.is_none() {
            missing.push("text".to_string());
        }
        if remind_at.is_none() {
            missing.push("remindAt".to_string());
        }

        let in_past = remind_at.is_some_and(|at| at < Utc::now());
        let draft = ReminderDraft { text, remind_at };
        if in_past {
            return ExtractionResult::incomplete(
                Some(ReminderDraft {
                    remind_at: None,
                    ..draft
                }),
                vec!["remindAt".into()],
                Some("When do you want to be reminded?".into()),
            );
        }
        if missing.is_empty() {
            let tz = parse_timezone(timezone);
            let message = format!(
                "Set the reminder \"{}\" for {}",
                draft.text.as_deref().unwrap_or_default(),
                draft
                    .remind_at
                    .map(|at| at.with_timezone(&tz).format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default(),
            );
            ExtractionResult::complete(draft, Some(message))
        } else {
            ExtractionResult::incomplete(Some(draft), missing, None)
        }
    }

    async fn identify_entity_id(
        &self,
        _all_entities: &[Reminder],
        _raw_text: &str,
        _exchange: Option<&ClarificationExchange>,
        _friendship_id: &FriendshipId,
        _timezone: &str,
        _message_time: DateTime<Utc>,
    ) -> IdResolution {
        IdResolution::NotNeeded { id: None }
    }
}

struct UpdateReminderEntityHandler {
    llm: Arc<dyn LanguageModel>,
    model: String,
}

#[async_trait]
impl CrudEntityHandler<ReminderDraft, Reminder> for UpdateReminderEntityHandler {
    async fn extract_entity_data(
        &self,
        raw_text: &str,
        previous_data: Option<&ReminderDraft>,
        exchange: Option<&ClarificationExchange>,
        _friendship_id: &FriendshipId,
        timezone: &str,
        message_time: DateTime<Utc>,
    ) -> ExtractionResult<ReminderDraft> {
        let prompt = format!(
            "You are helping to update a reminder for the user.\n\n\
             A reminder consists of a text and a datetime at which it triggers.\n\n\
             Extract only the new values the user explicitly wants to apply to an existing reminder:\n\
             - text: the new reminder text (optional)\n\
             - remindAt: the new ISO 8601 datetime, e.g., 2042-01-21T12:30 (optional)\n\n\
             Do NOT reuse values that merely describe the current reminder.\n\
             Output a valid JSON object with only the fields to update. NO explanation.\n\n\
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
            None => return ExtractionResult::incomplete(None, vec![], None),
        };

        let text = json
            .get("text")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .or_else(|| previous_data.and_then(|p| p.text.clone()));
        let remind_at = json
            .get("remindAt")
            .and_then(Value::as_str)
            .and_then(|raw| parse_local_datetime(raw, timezone))
            .or_else(|| previous_data.and_then(|p| p.remind_at));

        if text.is_none() && remind_at.is_none() {
            ExtractionResult::incomplete(None, vec![], None)
        } else {
            ExtractionResult::complete(
                ReminderDraft { text, remind_at },
                Some("Updated the reminder".to_string()),
            )
        }
    }

    async fn identify_entity_id(
        &self,
        all_entities: &[Reminder],
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
            "update",
            "reminder",
            &reminder_list_text(all_entities, timezone),
            raw_text,
            exchange,
            timezone,
            message_time,
        )
        .await
    }
}

struct RemoveReminderEntityHandler {
    llm: Arc<dyn LanguageModel>,
    model: String,
}

#[async_trait]
impl CrudEntityHandler<ReminderDraft, Reminder> for RemoveReminderEntityHandler {
    async fn extract_entity_data(
        &self,
        _raw_text: &str,
        _previous_data: Option<&ReminderDraft>,
        _exchange: Option<&ClarificationExchange>,
        _friendship_id: &FriendshipId,
        _timezone: &str,
        _message_time: DateTime<Utc>,
    ) -> ExtractionResult<ReminderDraft> {
        ExtractionResult::complete(ReminderDraft::default(), Some("Removed the reminder".to_string()))
    }

    async fn identify_entity_id(
        &self,
        all_entities: &[Reminder],
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
            "remove",
            "reminder",
            &reminder_list_text(all_entities, timezone),
            raw_text,
            exchange,
            timezone,
            message_time,
        )
        .await
    }
}

struct SetReminderSource {
    store: Arc<dyn ReminderStore>,
}

#[async_trait]
impl EntitySource<ReminderDraft, Reminder> for SetReminderSource {
    async fn load_entities(&self, _friendship_id: &FriendshipId) -> anyhow::Result<Vec<Reminder>> {
        Ok(vec![])
    }

    async fn apply_update(
        &self,
        friendship_id: &FriendshipId,
        _id: Option<&str>,
        entity: ReminderDraft,
    ) -> anyhow::Result<()> {
        let (text, remind_at) = match (entity.text, entity.remind_at) {
            (Some(text), Some(remind_at)) => (text, remind_at),
            _ => anyhow::bail!("text and remindAt are mandatory"),
        };
        if remind_at < Utc::now() {
            anyhow::bail!("remindAt must be in the future");
        }
        self.store.set_reminder(friendship_id, &text, remind_at).await?;
        Ok(())
    }
}

struct UpdateReminderSource {
    store: Arc<dyn ReminderStore>,
}

#[async_trait]
impl EntitySource<ReminderDraft, Reminder> for UpdateReminderSource {
    async fn load_entities(&self, friendship_id: &FriendshipId) -> anyhow::Result<Vec<Reminder>> {
        self.store.reminders_of(friendship_id).await
    }

    async fn apply_update(
        &self,
        friendship_id: &FriendshipId,
        id: Option<&str>,
        entity: ReminderDraft,
    ) -> anyhow::Result<()> {
        match id {
            Some(id) => self.store.update_reminder(friendship_id, id, &entity).await,
            None => anyhow::bail!("reminder update without id"),
        }
    }
}

struct RemoveReminderSource {
    store: Arc<dyn ReminderStore>,
}

#[async_trait]
impl EntitySource<ReminderDraft, Reminder> for RemoveReminderSource {
    async fn load_entities(&self, friendship_id: &FriendshipId) -> anyhow::Result<Vec<Reminder>> {
        self.store.reminders_of(friendship_id).await
    }

    async fn apply_update(
        &self,
        friendship_id: &FriendshipId,
        id: Option<&str>,
        _entity: ReminderDraft,
    ) -> anyhow::Result<()> {
        match id {
            Some(id) => self.store.remove_reminder(friendship_id, id).await,
            None => anyhow::bail!("reminder removal without id"),
        }
    }
}

struct ListRemindersHandler {
    store: Arc<dyn ReminderStore>,
    ledger: Arc<dyn FriendshipLedger>,
}

#[async_trait]
impl SubtaskHandler for ListRemindersHandler {
    fn can_handle(&self, intent: &Intent) -> bool {
        *intent == ReminderIntents::list()
    }

    async fn handle(
        &self,
        subtask: &Subtask,
        _context: &GoalContext,
        friendship_id: &FriendshipId,
    ) -> SubtaskResult {
        let reminders = match self.store.reminders_of(friendship_id).await {
            Ok(reminders) => reminders,
            Err(err) => {
                return SubtaskResult::failure(
                    &format!("Loading reminders failed: {err}"),
                    subtask.clone(),
                )
            }
        };
        let prompt = if reminders.is_empty() {
            "Tell the user they have no reminders at the moment.".to_string()
        } else {
            let timezone = self.ledger.timezone_of(friendship_id).await;
            let tz = parse_timezone(&timezone);
            let listing = reminders
                .iter()
                .map(|r| {
                    format!(
                        "- {}: will trigger at {}",
                        r.text,
                        r.remind_at.with_timezone(&tz).format("%Y-%m-%d %H:%M"),
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            format!(
                "Show the user their reminders:\n{listing}\n\
                 Convert reminder times to a human-friendly format like \"today at 3pm\" or \"next Monday, 10:30am\".",
            )
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
        Box::new(StaticIntentContributor::new(
            ReminderIntents::set(),
            "Set a reminder for a specific date and time",
        )),
        Box::new(StaticIntentContributor::new(
            ReminderIntents::list(),
            "List your reminders",
        )),
        Box::new(StaticIntentContributor::new(
            ReminderIntents::update(),
            "Update a reminder scheduled for a specific date and time",
        )),
        Box::new(StaticIntentContributor::new(
            ReminderIntents::remove(),
            "Remove a reminder scheduled for a specific date and time",
        )),
    ]
}

pub fn subtask_contributors() -> Vec<Arc<dyn SubtaskContributor>> {
    vec![
        Arc::new(MessageSubtaskContributor::new(ReminderIntents::set(), "Set reminder")),
        Arc::new(MessageSubtaskContributor::new(ReminderIntents::list(), "List reminders")),
        Arc::new(MessageSubtaskContributor::new(ReminderIntents::update(), "Update reminder")),
        Arc::new(MessageSubtaskContributor::new(ReminderIntents::remove(), "Remove reminder")),
    ]
}

pub fn subtask_handlers(
    llm: Arc<dyn LanguageModel>,
    store: Arc<dyn ReminderStore>,
    ledger: Arc<dyn FriendshipLedger>,
    model: &str,
) -> Vec<Arc<dyn SubtaskHandler>> {
    vec![
        Arc::new(CrudSubtaskHandler::new(
            ReminderIntents::set(),
            Arc::new(SetReminderEntityHandler {
                llm: llm.clone(),
                model: model.to_string(),
            }),
            Arc::new(SetReminderSource { store: store.clone() }),
            ledger.clone(),
        )
        .with_data_question("When should I remind you, and what should the reminder say?")),
        Arc::new(CrudSubtaskHandler::new(
            ReminderIntents::update(),
            Arc::new(UpdateReminderEntityHandler {
                llm: llm.clone(),
                model: model.to_string(),
            }),
            Arc::new(UpdateReminderSource { store: store.clone() }),
            ledger.clone(),
        )
        .with_id_question("Which reminder should be updated?")),
        Arc::new(CrudSubtaskHandler::new(
            ReminderIntents::remove(),
            Arc::new(RemoveReminderEntityHandler {
                llm,
                model: model.to_string(),
            }),
            Arc::new(RemoveReminderSource { store: store.clone() }),
            ledger.clone(),
        )
        .with_id_question("Which reminder should be removed?")),
        Arc::new(ListRemindersHandler { store, ledger }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockLanguageModel, StaticLedger};
    use crate::types::{Channel, MessageId};
    use std::sync::Mutex;

    struct InMemoryReminders {
        reminders: Mutex<Vec<Reminder>>,
        removed: Mutex<Vec<String>>,
    }

    impl InMemoryReminders {
        fn new(reminders: Vec<Reminder>) -> Self {
            Self {
                reminders: Mutex::new(reminders),
                removed: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl ReminderStore for InMemoryReminders {
        async fn reminders_of(&self, _friendship_id: &FriendshipId) -> anyhow::Result<Vec<Reminder>> {
            Ok(self.reminders.lock().unwrap().clone())
        }

        async fn set_reminder(
            &self,
            _friendship_id: &FriendshipId,
            text: &str,
            remind_at: DateTime<Utc>,
        ) -> anyhow::Result<Reminder> {
            let reminder = Reminder {
                id: format!("{}", self.reminders.lock().unwrap().len() + 1),
                text: text.to_string(),
                remind_at,
            };
            self.reminders.lock().unwrap().push(reminder.clone());
            Ok(reminder)
        }

        async fn update_reminder(
            &self,
            _friendship_id: &FriendshipId,
            id: &str,
            changes: &ReminderDraft,
        ) -> anyhow::Result<()> {
            let mut reminders = self.reminders.lock().unwrap();
            let reminder = reminders
                .iter_mut()
                .find(|r| r.id == id)
                .ok_or_else(|| anyhow::anyhow!("no reminder {id}"))?;
            if let Some(text) = &changes.text {
                reminder.text = text.clone();
            }
            if let Some(remind_at) = changes.remind_at {
                reminder.remind_at = remind_at;
            }
            Ok(())
        }

        async fn remove_reminder(
            &self,
            _friendship_id: &FriendshipId,
            id: &str,
        ) -> anyhow::Result<()> {
            self.removed.lock().unwrap().push(id.to_string());
            Ok(())
        }
    }

    fn friendship() -> FriendshipId {
        FriendshipId("f".into())
    }

    fn subtask_for(intent: Intent, text: &str) -> Subtask {
        Subtask::for_message(
            intent,
            "test",
            &friendship(),
            &UserMessage::new(MessageId("m".into()), Utc::now(), text, Channel::Signal),
        )
    }

    fn handler_for(
        intent: &Intent,
        llm: Arc<MockLanguageModel>,
        store: Arc<InMemoryReminders>,
    ) -> Arc<dyn SubtaskHandler> {
        subtask_handlers(llm, store, Arc::new(StaticLedger::utc()), "model")
            .into_iter()
            .find(|h| h.can_handle(intent))
            .unwrap()
    }

    fn reminder(id: &str, text: &str) -> Reminder {
        Reminder {
            id: id.to_string(),
            text: text.to_string(),
            remind_at: Utc.with_ymd_and_hms(2099, 6, 1, 9, 0, 0).unwrap(),
        }
    }

    #[test]
    fn local_datetimes_resolve_in_the_given_timezone() {
        let parsed = parse_local_datetime("2099-06-01T09:00", "Europe/Berlin").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2099, 6, 1, 7, 0, 0).unwrap());

        let with_seconds = parse_local_datetime("2099-06-01T09:00:00Z", "UTC").unwrap();
        assert_eq!(with_seconds, Utc.with_ymd_and_hms(2099, 6, 1, 9, 0, 0).unwrap());

        assert!(parse_local_datetime("whenever", "UTC").is_none());
    }

    #[tokio::test]
    async fn set_reminder_with_text_and_time_stores_it() {
        let llm = Arc::new(MockLanguageModel::new());
        llm.push_json(r#"{"text": "call Sarah", "remindAt": "2099-06-02T09:00"}"#);
        let store = Arc::new(InMemoryReminders::new(vec![]));
        let handler = handler_for(&ReminderIntents::set(), llm, store.clone());

        let result = handler
            .handle(
                &subtask_for(ReminderIntents::set(), "Remind me tomorrow at 9am to call Sarah"),
                &GoalContext::none(),
                &friendship(),
            )
            .await;

        assert!(result.updated_subtask.completed());
        let reminders = store.reminders.lock().unwrap();
        assert_eq!(reminders.len(), 1);
        assert_eq!(reminders[0].text, "call Sarah");
    }

    #[tokio::test]
    async fn set_reminder_without_time_asks_for_it() {
        let llm = Arc::new(MockLanguageModel::new());
        llm.push_json(r#"{"text": "call Sarah"}"#);
        let store = Arc::new(InMemoryReminders::new(vec![]));
        let handler = handler_for(&ReminderIntents::set(), llm, store.clone());

        let result = handler
            .handle(
                &subtask_for(ReminderIntents::set(), "Remind me to call Sarah"),
                &GoalContext::none(),
                &friendship(),
            )
            .await;

        assert!(result.updated_subtask.needs_clarification());
        assert!(store.reminders.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_reminder_in_the_past_asks_for_a_new_time() {
        let llm = Arc::new(MockLanguageModel::new());
        llm.push_json(r#"{"text": "call Sarah", "remindAt": "2001-06-01T09:00"}"#);
        let store = Arc::new(InMemoryReminders::new(vec![]));
        let handler = handler_for(&ReminderIntents::set(), llm, store.clone());

        let result = handler
            .handle(
                &subtask_for(ReminderIntents::set(), "Remind me to call Sarah"),
                &GoalContext::none(),
                &friendship(),
            )
            .await;

        assert!(result.updated_subtask.needs_clarification());
        assert!(result
            .clarification_question
            .unwrap()
            .text
            .contains("When do you want to be reminded?"));
    }

    #[tokio::test]
    async fn remove_reminder_resolves_id_via_model() {
        let llm = Arc::new(MockLanguageModel::new());
        llm.push_json(r#"{"id": "2"}"#);
        let store = Arc::new(InMemoryReminders::new(vec![
            reminder("1", "water the plants"),
            reminder("2", "feed the cat"),
        ]));
        let handler = handler_for(&ReminderIntents::remove(), llm, store.clone());

        let result = handler
            .handle(
                &subtask_for(ReminderIntents::remove(), "remove the one about the cat"),
                &GoalContext::none(),
                &friendship(),
            )
            .await;

        assert!(result.updated_subtask.completed());
        assert_eq!(store.removed.lock().unwrap().as_slice(), ["2".to_string()]);
    }

    #[tokio::test]
    async fn update_reminder_applies_only_extracted_fields() {
        let llm = Arc::new(MockLanguageModel::new());
        llm.push_json(r#"{"remindAt": "2099-07-01T10:00"}"#);
        let store = Arc::new(InMemoryReminders::new(vec![reminder("1", "feed the cat")]));
        let handler = handler_for(&ReminderIntents::update(), llm, store.clone());

        let result = handler
            .handle(
                &subtask_for(ReminderIntents::update(), "move my reminder to July 1st at 10"),
                &GoalContext::none(),
                &friendship(),
            )
            .await;

        assert!(result.updated_subtask.completed());
        let reminders = store.reminders.lock().unwrap();
        assert_eq!(reminders[0].text, "feed the cat");
        assert_eq!(
            reminders[0].remind_at,
            Utc.with_ymd_and_hms(2099, 7, 1, 10, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn list_reminders_renders_the_stored_reminders() {
        let llm = Arc::new(MockLanguageModel::new());
        let store = Arc::new(InMemoryReminders::new(vec![reminder("1", "feed the cat")]));
        let handler = handler_for(&ReminderIntents::list(), llm, store);

        let result = handler
            .handle(
                &subtask_for(ReminderIntents::list(), "what are my reminders?"),
                &GoalContext::none(),
                &friendship(),
            )
            .await;

        assert!(result.updated_subtask.completed());
        assert!(result.success_message_prompt.unwrap().contains("feed the cat"));
    }
}
