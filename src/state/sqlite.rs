use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::warn;
use uuid::Uuid;

use crate::handlers::reminders::{Reminder, ReminderDraft, ReminderStore};
use crate::handlers::tasks::{NewTask, Task, TaskChanges, TaskStore};
use crate::handlers::timers::{Timer, TimerStore};
use crate::interaction::context::GoalContext;
use crate::interaction::intent::Intent;
use crate::traits::{ConversationLog, FriendshipLedger, GoalContextRepository};
use crate::types::{Conversation, ConversationTurn, FriendshipId, UserMessage};

/// Set restrictive file permissions (0600) on the database and WAL files.
fn set_db_file_permissions(db_path: &str) {
    use std::os::unix::fs::PermissionsExt;
    let mode = std::fs::Permissions::from_mode(0o600);
    if let Err(e) = std::fs::set_permissions(db_path, mode.clone()) {
        warn!("Failed to set permissions on {}: {}", db_path, e);
    }
    for suffix in &["-wal", "-shm"] {
        let path = format!("{}{}", db_path, suffix);
        if std::path::Path::new(&path).exists() {
            if let Err(e) = std::fs::set_permissions(&path, mode.clone()) {
                warn!("Failed to set permissions on {}: {}", path, e);
            }
        }
    }
}

fn parse_rfc3339(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// All persistence behind one SQLite pool. Goal contexts are stored as JSON
/// blobs with last-write-wins semantics; everything else is row-per-entity.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new(db_path: &str) -> anyhow::Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;

        set_db_file_permissions(db_path);

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS goal_contexts (
                friendship_id TEXT PRIMARY KEY,
                context_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS friendships (
                friendship_id TEXT PRIMARY KEY,
                timezone TEXT NOT NULL DEFAULT 'UTC',
                created_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversations (
                friendship_id TEXT PRIMARY KEY,
                intent TEXT NOT NULL,
                started_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversation_turns (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                friendship_id TEXT NOT NULL,
                from_user INTEGER NOT NULL,
                text TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_turns_friendship ON conversation_turns(friendship_id)",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                friendship_id TEXT NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                completed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                last_modified_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_tasks_friendship ON tasks(friendship_id)")
            .execute(&pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS reminders (
                id TEXT PRIMARY KEY,
                friendship_id TEXT NOT NULL,
                text TEXT NOT NULL,
                remind_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_reminders_friendship ON reminders(friendship_id)",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS timers (
                id TEXT PRIMARY KEY,
                friendship_id TEXT NOT NULL,
                label TEXT,
                duration_secs INTEGER NOT NULL,
                started_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_timers_friendship ON timers(friendship_id)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    pub async fn set_timezone(
        &self,
        friendship_id: &FriendshipId,
        timezone: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT INTO friendships (friendship_id, timezone, created_at) VALUES (?, ?, ?)
             ON CONFLICT(friendship_id) DO UPDATE SET timezone = excluded.timezone",
        )
        .bind(&friendship_id.0)
        .bind(timezone)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl GoalContextRepository for SqliteStore {
    async fn load_context(
        &self,
        friendship_id: &FriendshipId,
    ) -> anyhow::Result<Option<GoalContext>> {
        let row = sqlx::query("SELECT context_json FROM goal_contexts WHERE friendship_id = ?")
            .bind(&friendship_id.0)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let json: String = row.get("context_json");
        match serde_json::from_str(&json) {
            Ok(context) => Ok(Some(context)),
            Err(err) => {
                warn!(friendship_id = %friendship_id, "Discarding unreadable goal context: {err}");
                Ok(None)
            }
        }
    }

    async fn save_context(
        &self,
        friendship_id: &FriendshipId,
        context: &GoalContext,
    ) -> anyhow::Result<()> {
        let json = serde_json::to_string(context)?;
        sqlx::query(
            "INSERT INTO goal_contexts (friendship_id, context_json, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(friendship_id) DO UPDATE SET
                 context_json = excluded.context_json,
                 updated_at = excluded.updated_at",
        )
        .bind(&friendship_id.0)
        .bind(json)
        .bind(context.last_updated.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl FriendshipLedger for SqliteStore {
    async fn timezone_of(&self, friendship_id: &FriendshipId) -> String {
        let row = sqlx::query("SELECT timezone FROM friendships WHERE friendship_id = ?")
            .bind(&friendship_id.0)
            .fetch_optional(&self.pool)
            .await;
        match row {
            Ok(Some(row)) => row.get("timezone"),
            Ok(None) => "UTC".to_string(),
            Err(err) => {
                warn!("Loading timezone failed: {err}");
                "UTC".to_string()
            }
        }
    }
}

#[async_trait]
impl ConversationLog for SqliteStore {
    async fn append_user_message(
        &self,
        friendship_id: &FriendshipId,
        message: &UserMessage,
    ) -> anyhow::Result<()> {
        let active = sqlx::query("SELECT friendship_id FROM conversations WHERE friendship_id = ?")
            .bind(&friendship_id.0)
            .fetch_optional(&self.pool)
            .await?;
        if active.is_none() {
            return Ok(());
        }
        sqlx::query(
            "INSERT INTO conversation_turns (friendship_id, from_user, text, created_at)
             VALUES (?, 1, ?, ?)",
        )
        .bind(&friendship_id.0)
        .bind(&message.text)
        .bind(message.received_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn current_conversation(
        &self,
        friendship_id: &FriendshipId,
    ) -> anyhow::Result<Option<Conversation>> {
        let active = sqlx::query("SELECT friendship_id FROM conversations WHERE friendship_id = ?")
            .bind(&friendship_id.0)
            .fetch_optional(&self.pool)
            .await?;
        if active.is_none() {
            return Ok(None);
        }
        let rows = sqlx::query(
            "SELECT from_user, text, created_at FROM conversation_turns
             WHERE friendship_id = ? ORDER BY id",
        )
        .bind(&friendship_id.0)
        .fetch_all(&self.pool)
        .await?;
        let turns = rows
            .iter()
            .map(|row| {
                let created: String = row.get("created_at");
                ConversationTurn {
                    from_user: row.get::<i64, _>("from_user") == 1,
                    text: row.get("text"),
                    created_at: parse_rfc3339(&created),
                }
            })
            .collect();
        Ok(Some(Conversation { turns }))
    }

    async fn start_conversation(
        &self,
        friendship_id: &FriendshipId,
        intent: &Intent,
        message: &UserMessage,
    ) -> anyhow::Result<()> {
        self.end_conversation(friendship_id).await?;
        sqlx::query("INSERT INTO conversations (friendship_id, intent, started_at) VALUES (?, ?, ?)")
            .bind(&friendship_id.0)
            .bind(intent.name())
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "INSERT INTO conversation_turns (friendship_id, from_user, text, created_at)
             VALUES (?, 1, ?, ?)",
        )
        .bind(&friendship_id.0)
        .bind(&message.text)
        .bind(message.received_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn end_conversation(&self, friendship_id: &FriendshipId) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM conversations WHERE friendship_id = ?")
            .bind(&friendship_id.0)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM conversation_turns WHERE friendship_id = ?")
            .bind(&friendship_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Task {
    let created: String = row.get("created_at");
    let modified: String = row.get("last_modified_at");
    Task {
        id: row.get("id"),
        title: row.get("title"),
        description: row.get("description"),
        completed: row.get::<i64, _>("completed") == 1,
        created_at: parse_rfc3339(&created),
        last_modified_at: parse_rfc3339(&modified),
    }
}

#[async_trait]
impl TaskStore for SqliteStore {
    async fn tasks_of(&self, friendship_id: &FriendshipId) -> anyhow::Result<Vec<Task>> {
        let rows = sqlx::query(
            "SELECT id, title, description, completed, created_at, last_modified_at
             FROM tasks WHERE friendship_id = ? ORDER BY created_at",
        )
        .bind(&friendship_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_task).collect())
    }

    async fn create_task(
        &self,
        friendship_id: &FriendshipId,
        task: &NewTask,
    ) -> anyhow::Result<Task> {
        let now = Utc::now();
        let created = Task {
            id: Uuid::new_v4().to_string(),
            title: task.title.clone(),
            description: task.description.clone(),
            completed: false,
            created_at: now,
            last_modified_at: now,
        };
        sqlx::query(
            "INSERT INTO tasks (id, friendship_id, title, description, completed, created_at, last_modified_at)
             VALUES (?, ?, ?, ?, 0, ?, ?)",
        )
        .bind(&created.id)
        .bind(&friendship_id.0)
        .bind(&created.title)
        .bind(&created.description)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(created)
    }

    async fn update_task(
        &self,
        friendship_id: &FriendshipId,
        id: &str,
        changes: &TaskChanges,
    ) -> anyhow::Result<()> {
        let result = sqlx::query(
            "UPDATE tasks SET
                 title = COALESCE(?, title),
                 description = COALESCE(?, description),
                 completed = COALESCE(?, completed),
                 last_modified_at = ?
             WHERE id = ? AND friendship_id = ?",
        )
        .bind(&changes.title)
        .bind(&changes.description)
        .bind(changes.completed.map(i64::from))
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .bind(&friendship_id.0)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("no task with id {id}");
        }
        Ok(())
    }

    async fn remove_task(&self, friendship_id: &FriendshipId, id: &str) -> anyhow::Result<()> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ? AND friendship_id = ?")
            .bind(id)
            .bind(&friendship_id.0)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("no task with id {id}");
        }
        Ok(())
    }
}

#[async_trait]
impl ReminderStore for SqliteStore {
    async fn reminders_of(&self, friendship_id: &FriendshipId) -> anyhow::Result<Vec<Reminder>> {
        let rows = sqlx::query(
            "SELECT id, text, remind_at FROM reminders WHERE friendship_id = ? ORDER BY remind_at",
        )
        .bind(&friendship_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let remind_at: String = row.get("remind_at");
                Reminder {
                    id: row.get("id"),
                    text: row.get("text"),
                    remind_at: parse_rfc3339(&remind_at),
                }
            })
            .collect())
    }

    async fn set_reminder(
        &self,
        friendship_id: &FriendshipId,
        text: &str,
        remind_at: DateTime<Utc>,
    ) -> anyhow::Result<Reminder> {
        let reminder = Reminder {
            id: Uuid::new_v4().to_string(),
            text: text.to_string(),
            remind_at,
        };
        sqlx::query("INSERT INTO reminders (id, friendship_id, text, remind_at) VALUES (?, ?, ?, ?)")
            .bind(&reminder.id)
            .bind(&friendship_id.0)
            .bind(&reminder.text)
            .bind(remind_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(reminder)
    }

    async fn update_reminder(
        &self,
        friendship_id: &FriendshipId,
        id: &str,
        changes: &ReminderDraft,
    ) -> anyhow::Result<()> {
        let result = sqlx::query(
            "UPDATE reminders SET
                 text = COALESCE(?, text),
                 remind_at = COALESCE(?, remind_at)
             WHERE id = ? AND friendship_id = ?",
        )
        .bind(&changes.text)
        .bind(changes.remind_at.map(|at| at.to_rfc3339()))
        .bind(id)
        .bind(&friendship_id.0)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("no reminder with id {id}");
        }
        Ok(())
    }

    async fn remove_reminder(&self, friendship_id: &FriendshipId, id: &str) -> anyhow::Result<()> {
        let result = sqlx::query("DELETE FROM reminders WHERE id = ? AND friendship_id = ?")
            .bind(id)
            .bind(&friendship_id.0)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("no reminder with id {id}");
        }
        Ok(())
    }
}

#[async_trait]
impl TimerStore for SqliteStore {
    async fn timers_of(&self, friendship_id: &FriendshipId) -> anyhow::Result<Vec<Timer>> {
        let rows = sqlx::query(
            "SELECT id, label, duration_secs, started_at FROM timers
             WHERE friendship_id = ? ORDER BY started_at",
        )
        .bind(&friendship_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| {
                let started: String = row.get("started_at");
                Timer {
                    id: row.get("id"),
                    label: row.get("label"),
                    duration: Duration::from_secs(row.get::<i64, _>("duration_secs").max(0) as u64),
                    started_at: parse_rfc3339(&started),
                }
            })
            .collect())
    }

    async fn start_timer(
        &self,
        friendship_id: &FriendshipId,
        label: Option<&str>,
        duration: Duration,
    ) -> anyhow::Result<Timer> {
        let timer = Timer {
            id: Uuid::new_v4().to_string(),
            label: label.map(str::to_string),
            duration,
            started_at: Utc::now(),
        };
        sqlx::query(
            "INSERT INTO timers (id, friendship_id, label, duration_secs, started_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&timer.id)
        .bind(&friendship_id.0)
        .bind(&timer.label)
        .bind(duration.as_secs() as i64)
        .bind(timer.started_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(timer)
    }

    async fn remove_timer(&self, friendship_id: &FriendshipId, id: &str) -> anyhow::Result<()> {
        let result = sqlx::query("DELETE FROM timers WHERE id = ? AND friendship_id = ?")
            .bind(id)
            .bind(&friendship_id.0)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            anyhow::bail!("no timer with id {id}");
        }
        Ok(())
    }
}
