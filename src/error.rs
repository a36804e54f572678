//! Error types for agent-foundry.

use std::path::PathBuf;

use uuid::Uuid;

use crate::task::TaskStatus;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

impl Error {
    /// Whether this is a recoverable merge conflict the caller must resolve.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Workspace(WorkspaceError::MergeConflict { .. }))
    }

    /// Whether the operation is not available for the active VCS.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Workspace(WorkspaceError::Unsupported { .. }))
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("No git or jj repository found above {0}")]
    RepositoryNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Workspace and VCS subprocess errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("`{command}` failed (exit code {code:?}): {output}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        output: String,
    },

    #[error("Failed to spawn `{command}`: {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("Merge conflict in {} file(s) in {}", files.len(), workspace_path.display())]
    MergeConflict {
        files: Vec<String>,
        workspace_path: PathBuf,
    },

    #[error("{operation} is not supported for {vcs} repositories")]
    Unsupported { operation: String, vcs: String },

    #[error("Workspace for task {task_id} not found")]
    NotFound { task_id: Uuid },

    #[error("Neither main nor master could be checked out: {0}")]
    NoMainBranch(String),

    #[error("Command cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// AI backend errors.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error("Backend {backend} is not configured: {reason}")]
    NotConfigured { backend: String, reason: String },

    #[error("Backend {backend} failed: {reason}")]
    Failed { backend: String, reason: String },

    #[error("Invalid history for backend {backend}: {reason}")]
    InvalidHistory { backend: String, reason: String },

    #[error("Backend run cancelled")]
    Cancelled,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Task lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} is {from}, cannot transition to {to}")]
    InvalidTransition {
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {id} is already running")]
    AlreadyRunning { id: Uuid },

    #[error("Orchestrator is shutting down")]
    ShuttingDown,
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
