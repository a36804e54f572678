//! Event wire shape published to observers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::TaskStatus;

/// Kind of a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    TaskCreated,
    /// Live agent progress; the latest one is cached for reconnects.
    AgentUpdate,
    StatusChange,
    Log,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskCreated => "task_created",
            Self::AgentUpdate => "agent_update",
            Self::StatusChange => "status_change",
            Self::Log => "log",
        }
    }
}

/// A published event. `id` is assigned by the bus at publish time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub task_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// JSON-encoded payload.
    pub data: String,
}

impl Event {
    /// Decode the payload of a `status_change` event.
    pub fn status(&self) -> Option<StatusPayload> {
        if self.event_type != EventType::StatusChange {
            return None;
        }
        serde_json::from_str(&self.data).ok()
    }

    /// Whether this event reports that a task's run is over.
    pub fn ends_run(&self) -> bool {
        self.status().is_some_and(|p| p.status.ends_run())
    }
}

/// Payload of a `status_change` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl StatusPayload {
    pub fn new(status: TaskStatus, note: Option<String>) -> Self {
        Self { status, note }
    }

    pub fn to_data(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Payload of a `log` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPayload {
    pub level: String,
    pub message: String,
}

impl LogPayload {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: "info".to_string(),
            message: message.into(),
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            level: "warn".to_string(),
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: "error".to_string(),
            message: message.into(),
        }
    }

    pub fn to_data(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
