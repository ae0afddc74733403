use std::sync::Arc;

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

pub struct TaskIntents;

impl TaskIntents {
    pub fn add() -> Intent {
        Intent::new("AddTask")
    }
    pub fn list() -> Intent {
        Intent::new("ListTasks")
    }
    pub fn complete() -> Intent {
        Intent::new("CompleteTask")
    }
    pub fn update() -> Intent {
        Intent::new("UpdateTask")
    }
    pub fn remove() -> Intent {
        Intent::new("RemoveTask")
    }
}

/// A stored task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: Option<String>,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
}

/// Payload for creating a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
}

/// Partial update. Only fields the user explicitly wants changed are set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskChanges {
    pub title: Option<String>,
    pub description: Option<String>,
    pub completed: Option<bool>,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn tasks_of(&self, friendship_id: &FriendshipId) -> anyhow::Result<Vec<Task>>;
    async fn create_task(&self, friendship_id: &FriendshipId, task: &NewTask) -> anyhow::Result<Task>;
    async fn update_task(
        &self,
        friendship_id: &FriendshipId,
        id: &str,
        changes: &TaskChanges,
    ) -> anyhow::Result<()>;
    async fn remove_task(&self, friendship_id: &FriendshipId, id: &str) -> anyhow::Result<()>;
}

fn task_list_text(tasks: &[Task]) -> String {
    if tasks.is_empty() {
        return "There are no tasks".to_string();
    }
    tasks
        .iter()
        .map(|t| {
            format!(
                "- {}, description: {}, id={}",
                t.title,
                t.description.as_deref().unwrap_or("(none)"),
                t.id
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

struct AddTaskEntityHandler {
    llm: Arc<dyn LanguageModel>,
    model: String,
}

#[async_trait]
impl CrudEntityHandler<NewTask, Task> for AddTaskEntityHandler {
    async fn extract_entity_data(
        &self,
        raw_text: &str,
        previous_data: Option<&NewTask>,
        exchange: Option<&ClarificationExchange>,
        _friendship_id: &FriendshipId,
        timezone: &str,
        message_time: DateTime<Utc>,
    ) -> ExtractionResult<NewTask> {
        let prompt = format!(
            "You are helping to create a task for the user.\n\n\
             A task consists of a title and an optional description.\n\n\
             This is an interactive, multi-step conversation. The user provides input in stages. \
             If something is missing, clarification will be requested separately and added later.\n\n\
             Your task:\n\
             - Extract the task the user wants to add:\n\
               - title: a short name for the task (required)\n\
               - description: further details (optional)\n\n\
             Output a valid JSON object with only those fields.\n\
             Do NOT include explanation or unrelated text.\n\n\
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
            None => return ExtractionResult::incomplete(None, vec!["title".into()], None),
        };

        let title = json
            .get("title")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .or_else(|| previous_data.map(|p| p.title.clone()));
        let description = json
            .get("description")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .or_else(|| previous_data.and_then(|p| p.description.clone()));

        match title {
            Some(title) => {
                let message = format!("Added the task \"{title}\"");
                ExtractionResult::complete(NewTask { title, description }, Some(message))
            }
            None => ExtractionResult::incomplete(
                None,
                vec!["title".into()],
                Some("What should the task be called?".into()),
            ),
        }
    }

    async fn identify_entity_id(
        &self,
        _all_entities: &[Task],
        _raw_text: &str,
        _exchange: Option<&ClarificationExchange>,
        _friendship_id: &FriendshipId,
        _timezone: &str,
        _message_time: DateTime<Utc>,
    ) -> IdResolution {
        IdResolution::NotNeeded { id: None }
    }
}

struct UpdateTaskEntityHandler {
    llm: Arc<dyn LanguageModel>,
    model: String,
}

#[async_trait]
impl CrudEntityHandler<TaskChanges, Task> for UpdateTaskEntityHandler {
    async fn extract_entity_data(
        &self,
        raw_text: &str,
        previous_data: Option<&TaskChanges>,
        exchange: Option<&ClarificationExchange>,
        _friendship_id: &FriendshipId,
        timezone: &str,
        message_time: DateTime<Utc>,
    ) -> ExtractionResult<TaskChanges> {
        let prompt = format!(
            "You are helping to update a task for the user.\n\n\
             A task consists of a title, a description and is either completed or not.\n\n\
             This is an interactive, multi-step conversation. The user provides input in stages. \
             If something is missing, clarification will be requested separately and added later.\n\n\
             Your task:\n\
             - Extract only the new values the user explicitly wants to apply to an existing task:\n\
               - title: the new title (optional)\n\
               - description: the new description (optional)\n\
               - completed: whether the task should be marked completed (optional)\n\n\
             Do NOT use information that describes the current task, only what the user intends to CHANGE.\n\
             Do NOT guess or reuse values from the original message unless they are clearly intended as updates.\n\n\
             Output a valid JSON object with only the fields to update.\n\
             Do NOT include explanation or unrelated text.\n\n\
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

        let title = json
            .get("title")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .or_else(|| previous_data.and_then(|p| p.title.clone()));
        let description = json
            .get("description")
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .or_else(|| previous_data.and_then(|p| p.description.clone()));
        let completed = json
            .get("completed")
            .and_then(Value::as_bool)
            .or_else(|| previous_data.and_then(|p| p.completed));

        if title.is_none() && description.is_none() && completed.is_none() {
            ExtractionResult::incomplete(None, vec![], None)
        } else {
            ExtractionResult::complete(
                TaskChanges {
                    title,
                    description,
                    completed,
                },
                Some("Updated the task".to_string()),
            )
        }
    }

    async fn identify_entity_id(
        &self,
        all_entities: &[Task],
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
            "task",
            &task_list_text(all_entities),
            raw_text,
            exchange,
            timezone,
            message_time,
        )
        .await
    }
}

/// Completion and removal only need the target id; their "extraction" is a
/// fixed payload.
struct FixedChangesEntityHandler {
    llm: Arc<dyn LanguageModel>,
    model: String,
    action: &'static str,
    changes: TaskChanges,
    response_message: &'static str,
}

#[async_trait]
impl CrudEntityHandler<TaskChanges, Task> for FixedChangesEntityHandler {
    async fn extract_entity_data(
        &self,
        _raw_text: &str,
        _previous_data: Option<&TaskChanges>,
        _exchange: Option<&ClarificationExchange>,
        _friendship_id: &FriendshipId,
        _timezone: &str,
        _message_time: DateTime<Utc>,
    ) -> ExtractionResult<TaskChanges> {
        ExtractionResult::complete(self.changes.clone(), Some(self.response_message.to_string()))
    }

    async fn identify_entity_id(
        &self,
        all_entities: &[Task],
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
            self.action,
            "task",
            &task_list_text(all_entities),
            raw_text,
            exchange,
            timezone,
            message_time,
        )
        .await
    }
}

struct CreateTaskSource {
    store: Arc<dyn TaskStore>,
}

#[async_trait]
impl EntitySource<NewTask, Task> for CreateTaskSource {
    async fn load_entities(&self, friendship_id: &FriendshipId) -> anyhow::Result<Vec<Task>> {
        self.store.tasks_of(friendship_id).await
    }

    async fn apply_update(
        &self,
        friendship_id: &FriendshipId,
        _id: Option<&str>,
        entity: NewTask,
    ) -> anyhow::Result<()> {
        self.store.create_task(friendship_id, &entity).await?;
        Ok(())
    }
}

struct UpdateTaskSource {
    store: Arc<dyn TaskStore>,
}

#[async_trait]
impl EntitySource<TaskChanges, Task> for UpdateTaskSource {
    async fn load_entities(&self, friendship_id: &FriendshipId) -> anyhow::Result<Vec<Task>> {
        self.store.tasks_of(friendship_id).await
    }

    async fn apply_update(
        &self,
        friendship_id: &FriendshipId,
        id: Option<&str>,
        entity: TaskChanges,
    ) -> anyhow::Result<()> {
        match id {
            Some(id) => self.store.update_task(friendship_id, id, &entity).await,
            None => anyhow::bail!("task update without id"),
        }
    }
}

struct RemoveTaskSource {
    store: Arc<dyn TaskStore>,
}

#[async_trait]
impl EntitySource<TaskChanges, Task> for RemoveTaskSource {
    async fn load_entities(&self, friendship_id: &FriendshipId) -> anyhow::Result<Vec<Task>> {
        self.store.tasks_of(friendship_id).await
    }

    async fn apply_update(
        &self,
        friendship_id: &FriendshipId,
        id: Option<&str>,
        _entity: TaskChanges,
    ) -> anyhow::Result<()> {
        match id {
            Some(id) => self.store.remove_task(friendship_id, id).await,
            None => anyhow::bail!("task removal without id"),
        }
    }
}

/// Listing needs no extraction; it renders the stored tasks into a
/// response-generation instruction.
struct ListTasksHandler {
    store: Arc<dyn TaskStore>,
}

#[async_trait]
impl SubtaskHandler for ListTasksHandler {
    fn can_handle(&self, intent: &Intent) -> bool {
        *intent == TaskIntents::list()
    }

    async fn handle(
        &self,
        subtask: &Subtask,
        _context: &GoalContext,
        friendship_id: &FriendshipId,
    ) -> SubtaskResult {
        let tasks = match self.store.tasks_of(friendship_id).await {
            Ok(tasks) => tasks,
            Err(err) => {
                return SubtaskResult::failure(&format!("Loading tasks failed: {err}"), subtask.clone())
            }
        };
        let prompt = if tasks.is_empty() {
            "Tell the user their task list is empty.".to_string()
        } else {
            let listing = tasks
                .iter()
                .map(|t| {
                    format!(
                        "- [{}] {}{}",
                        if t.completed { "x" } else { " " },
                        t.title,
                        t.description
                            .as_deref()
                            .map(|d| format!(" ({d})"))
                            .unwrap_or_default(),
                    )
                })
                .collect::<Vec<_>>()
                .join("\n");
            format!("Show the user their tasks:\n{listing}")
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
        Box::new(StaticIntentContributor::new(TaskIntents::add(), "Add a task")),
        Box::new(StaticIntentContributor::new(TaskIntents::list(), "List existing tasks")),
        Box::new(StaticIntentContributor::new(TaskIntents::complete(), "Mark tasks as done")),
        Box::new(StaticIntentContributor::new(
            TaskIntents::update(),
            "Update task title or description",
        )),
        Box::new(StaticIntentContributor::new(TaskIntents::remove(), "Delete an existing task")),
    ]
}

pub fn subtask_contributors() -> Vec<Arc<dyn SubtaskContributor>> {
    vec![
        Arc::new(MessageSubtaskContributor::new(TaskIntents::add(), "Add task")),
        Arc::new(MessageSubtaskContributor::new(TaskIntents::list(), "List tasks")),
        Arc::new(MessageSubtaskContributor::new(TaskIntents::complete(), "Complete task")),
        Arc::new(MessageSubtaskContributor::new(TaskIntents::update(), "Update task")),
        Arc::new(MessageSubtaskContributor::new(TaskIntents::remove(), "Remove task")),
    ]
}

pub fn subtask_handlers(
    llm: Arc<dyn LanguageModel>,
    store: Arc<dyn TaskStore>,
    ledger: Arc<dyn FriendshipLedger>,
    model: &str,
) -> Vec<Arc<dyn SubtaskHandler>> {
    vec![
        Arc::new(CrudSubtaskHandler::new(
            TaskIntents::add(),
            Arc::new(AddTaskEntityHandler {
                llm: llm.clone(),
                model: model.to_string(),
            }),
            Arc::new(CreateTaskSource { store: store.clone() }),
            ledger.clone(),
        )
        .with_data_question("What should the task be called?")),
        Arc::new(CrudSubtaskHandler::new(
            TaskIntents::update(),
            Arc::new(UpdateTaskEntityHandler {
                llm: llm.clone(),
                model: model.to_string(),
            }),
            Arc::new(UpdateTaskSource { store: store.clone() }),
            ledger.clone(),
        )
        .with_id_question("Which task should be updated?")),
        Arc::new(CrudSubtaskHandler::new(
            TaskIntents::complete(),
            Arc::new(FixedChangesEntityHandler {
                llm: llm.clone(),
                model: model.to_string(),
                action: "complete",
                changes: TaskChanges {
                    completed: Some(true),
                    ..TaskChanges::default()
                },
                response_message: "Marked the task as done",
            }),
            Arc::new(UpdateTaskSource { store: store.clone() }),
            ledger.clone(),
        )
        .with_id_question("Which task is done?")),
        Arc::new(CrudSubtaskHandler::new(
            TaskIntents::remove(),
            Arc::new(FixedChangesEntityHandler {
                llm,
                model: model.to_string(),
                action: "remove",
                changes: TaskChanges::default(),
                response_message: "Removed the task",
            }),
            Arc::new(RemoveTaskSource { store: store.clone() }),
            ledger,
        )
        .with_id_question("Which task should be removed?")),
        Arc::new(ListTasksHandler { store }),
    ]
}
