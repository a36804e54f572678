//! libSQL implementation of the `Store` trait.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! RFC 3339 text; message blocks are stored as a JSON array.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::Store;
use crate::task::{AgentRun, BackendSession, ContentBlock, Message, Role, Task, TaskStatus, Usage};

/// libSQL-backed store.
///
/// Holds a single connection reused for all operations.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let store = Self::from_database(db)?;
        store.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        let store = Self::from_database(db)?;
        store.run_migrations().await?;
        Ok(store)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn begin(&self) -> Result<(), DatabaseError> {
        self.conn
            .execute("BEGIN IMMEDIATE", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("begin: {e}")))?;
        Ok(())
    }

    /// Commit on success, roll back on any error.
    async fn finish<T>(&self, result: Result<T, DatabaseError>) -> Result<T, DatabaseError> {
        let result = match result {
            Ok(value) => match self.conn.execute("COMMIT", ()).await {
                Ok(_) => return Ok(value),
                Err(e) => Err(DatabaseError::Query(format!("commit: {e}"))),
            },
            Err(e) => Err(e),
        };
        if let Err(e) = self.conn.execute("ROLLBACK", ()).await {
            warn!(error = %e, "Rollback failed");
        }
        result
    }
}

// ── Row mapping ─────────────────────────────────────────────────────

const TASK_COLUMNS: &str =
    "id, repo, intent, status, status_note, position, backend, model, created_at, updated_at";

const RUN_COLUMNS: &str = "id, task_id, prompt, backend, provider, model, session_id, \
     input_tokens, output_tokens, final_message, created_at, completed_at";

const MESSAGE_COLUMNS: &str = "id, task_id, run_id, role, blocks, text, created_at";

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_uuid(s: &str, column: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s)
        .map_err(|e| DatabaseError::Serialization(format!("invalid uuid in {column}: {e}")))
}

fn text(row: &libsql::Row, idx: i32, what: &str) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Query(format!("{what}: column {idx}: {e}")))
}

fn integer(row: &libsql::Row, idx: i32, what: &str) -> Result<i64, DatabaseError> {
    row.get::<i64>(idx)
        .map_err(|e| DatabaseError::Query(format!("{what}: column {idx}: {e}")))
}

fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id = text(row, 0, "task")?;
    let status = text(row, 3, "task")?;
    let created = text(row, 8, "task")?;
    let updated = text(row, 9, "task")?;

    Ok(Task {
        id: parse_uuid(&id, "tasks.id")?,
        repo: text(row, 1, "task")?,
        intent: text(row, 2, "task")?,
        status: TaskStatus::parse(&status).ok_or_else(|| {
            DatabaseError::Serialization(format!("unknown task status '{status}'"))
        })?,
        status_note: row.get::<String>(4).ok(),
        position: integer(row, 5, "task")?,
        backend: row.get::<String>(6).ok(),
        model: row.get::<String>(7).ok(),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

fn row_to_run(row: &libsql::Row) -> Result<AgentRun, DatabaseError> {
    let id = text(row, 0, "agent_run")?;
    let task_id = text(row, 1, "agent_run")?;
    let input_tokens = integer(row, 7, "agent_run")?;
    let output_tokens = integer(row, 8, "agent_run")?;
    let created = text(row, 10, "agent_run")?;

    Ok(AgentRun {
        id: parse_uuid(&id, "agent_runs.id")?,
        task_id: parse_uuid(&task_id, "agent_runs.task_id")?,
        prompt: text(row, 2, "agent_run")?,
        backend: text(row, 3, "agent_run")?,
        provider: row.get::<String>(4).ok(),
        model: row.get::<String>(5).ok(),
        session_id: row.get::<String>(6).ok(),
        usage: Usage {
            input_tokens: input_tokens.max(0) as u64,
            output_tokens: output_tokens.max(0) as u64,
        },
        final_message: row.get::<String>(9).ok(),
        created_at: parse_datetime(&created),
        completed_at: row.get::<String>(11).ok().map(|s| parse_datetime(&s)),
    })
}

fn row_to_message(row: &libsql::Row) -> Result<Message, DatabaseError> {
    let id = text(row, 0, "message")?;
    let task_id = text(row, 1, "message")?;
    let role = text(row, 3, "message")?;
    let blocks = text(row, 4, "message")?;
    let created = text(row, 6, "message")?;

    let blocks: Vec<ContentBlock> = serde_json::from_str(&blocks)
        .map_err(|e| DatabaseError::Serialization(format!("message blocks: {e}")))?;

    Ok(Message {
        id: parse_uuid(&id, "messages.id")?,
        task_id: parse_uuid(&task_id, "messages.task_id")?,
        run_id: row
            .get::<String>(2)
            .ok()
            .map(|s| parse_uuid(&s, "messages.run_id"))
            .transpose()?,
        role: Role::parse(&role)
            .ok_or_else(|| DatabaseError::Serialization(format!("unknown role '{role}'")))?,
        blocks,
        text: text(row, 5, "message")?,
        created_at: parse_datetime(&created),
    })
}

// ── Store implementation ────────────────────────────────────────────

#[async_trait]
impl Store for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn create_task(&self, task: &Task) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO tasks (id, repo, intent, status, status_note, position, backend, model, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5,
                     (SELECT COALESCE(MAX(position), 0) + 1 FROM tasks WHERE repo = ?2),
                     ?6, ?7, ?8, ?9)",
            params![
                task.id.to_string(),
                task.repo.as_str(),
                task.intent.as_str(),
                task.status.as_str(),
                task.status_note.as_deref(),
                task.backend.as_deref(),
                task.model.as_deref(),
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("create_task: {e}")))?;

        let mut rows = conn
            .query(
                "SELECT position FROM tasks WHERE id = ?1",
                params![task.id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_task position: {e}")))?;
        let position = match rows.next().await {
            Ok(Some(row)) => integer(&row, 0, "create_task")?,
            Ok(None) => {
                return Err(DatabaseError::NotFound {
                    entity: "task".to_string(),
                    id: task.id.to_string(),
                });
            }
            Err(e) => return Err(DatabaseError::Query(format!("create_task row: {e}"))),
        };

        debug!(task_id = %task.id, position, "Task inserted");
        Ok(position)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task row: {e}"))),
        }
    }

    async fn list_tasks(&self, repo: Option<&str>) -> Result<Vec<Task>, DatabaseError> {
        let conn = self.conn();
        let mut rows = match repo {
            Some(repo) => conn
                .query(
                    &format!(
                        "SELECT {TASK_COLUMNS} FROM tasks WHERE repo = ?1 ORDER BY position ASC, created_at ASC"
                    ),
                    params![repo],
                )
                .await,
            None => conn
                .query(
                    &format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY repo ASC, position ASC"),
                    (),
                )
                .await,
        }
        .map_err(|e| DatabaseError::Query(format!("list_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn update_task_status(
        &self,
        id: Uuid,
        status: TaskStatus,
        note: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE tasks SET status = ?1, status_note = ?2, updated_at = ?3 WHERE id = ?4",
                params![status.as_str(), note, Utc::now().to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_task_status: {e}")))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "task".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn create_agent_run(&self, run: &AgentRun) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO agent_runs ({RUN_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    run.id.to_string(),
                    run.task_id.to_string(),
                    run.prompt.as_str(),
                    run.backend.as_str(),
                    run.provider.as_deref(),
                    run.model.as_deref(),
                    run.session_id.as_deref(),
                    run.usage.input_tokens as i64,
                    run.usage.output_tokens as i64,
                    run.final_message.as_deref(),
                    run.created_at.to_rfc3339(),
                    run.completed_at.map(|d| d.to_rfc3339()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_agent_run: {e}")))?;
        Ok(())
    }

    async fn create_task_with_run(
        &self,
        task: &Task,
        run: &AgentRun,
        message: &Message,
    ) -> Result<i64, DatabaseError> {
        self.begin().await?;
        let result: Result<i64, DatabaseError> = async {
            let position = self.create_task(task).await?;
            self.create_agent_run(run).await?;
            self.create_message(message).await?;
            Ok(position)
        }
        .await;
        self.finish(result).await
    }

    async fn create_run_with_message(
        &self,
        run: &AgentRun,
        message: &Message,
    ) -> Result<(), DatabaseError> {
        self.begin().await?;
        let result: Result<(), DatabaseError> = async {
            self.create_agent_run(run).await?;
            self.create_message(message).await
        }
        .await;
        self.finish(result).await
    }

    async fn set_agent_run_session(
        &self,
        run_id: Uuid,
        session_id: &str,
    ) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE agent_runs SET session_id = ?1 WHERE id = ?2",
                params![session_id, run_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_agent_run_session: {e}")))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "agent_run".to_string(),
                id: run_id.to_string(),
            });
        }
        Ok(())
    }

    async fn complete_agent_run(
        &self,
        run_id: Uuid,
        final_message: Option<&str>,
        usage: Usage,
    ) -> Result<(), DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE agent_runs
                 SET final_message = ?1, input_tokens = ?2, output_tokens = ?3, completed_at = ?4
                 WHERE id = ?5",
                params![
                    final_message,
                    usage.input_tokens as i64,
                    usage.output_tokens as i64,
                    Utc::now().to_rfc3339(),
                    run_id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("complete_agent_run: {e}")))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "agent_run".to_string(),
                id: run_id.to_string(),
            });
        }
        Ok(())
    }

    async fn latest_agent_run(&self, task_id: Uuid) -> Result<Option<AgentRun>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM agent_runs WHERE task_id = ?1 ORDER BY rowid DESC LIMIT 1"
                ),
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_agent_run: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_run(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("latest_agent_run row: {e}"))),
        }
    }

    async fn create_message(&self, message: &Message) -> Result<(), DatabaseError> {
        let blocks = serde_json::to_string(&message.blocks)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO messages ({MESSAGE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
                ),
                params![
                    message.id.to_string(),
                    message.task_id.to_string(),
                    message.run_id.map(|id| id.to_string()),
                    message.role.as_str(),
                    blocks,
                    message.text.as_str(),
                    message.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_message: {e}")))?;
        Ok(())
    }

    async fn list_messages(&self, task_id: Uuid) -> Result<Vec<Message>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE task_id = ?1 ORDER BY rowid ASC"),
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            messages.push(row_to_message(&row)?);
        }
        Ok(messages)
    }

    async fn upsert_session(&self, session: &BackendSession) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO backend_sessions (task_id, backend, native_session_id, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (task_id, backend)
                 DO UPDATE SET native_session_id = excluded.native_session_id,
                               updated_at = excluded.updated_at",
                params![
                    session.task_id.to_string(),
                    session.backend.as_str(),
                    session.native_session_id.as_str(),
                    session.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_session: {e}")))?;
        Ok(())
    }

    async fn get_session(
        &self,
        task_id: Uuid,
        backend: &str,
    ) -> Result<Option<BackendSession>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT native_session_id, updated_at FROM backend_sessions
                 WHERE task_id = ?1 AND backend = ?2",
                params![task_id.to_string(), backend],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_session: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let updated = text(&row, 1, "session")?;
                Ok(Some(BackendSession {
                    task_id,
                    backend: backend.to_string(),
                    native_session_id: text(&row, 0, "session")?,
                    updated_at: parse_datetime(&updated),
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_session row: {e}"))),
        }
    }

    async fn delete_session(&self, task_id: Uuid, backend: &str) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM backend_sessions WHERE task_id = ?1 AND backend = ?2",
                params![task_id.to_string(), backend],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_session: {e}")))?;
        Ok(count > 0)
    }
}
