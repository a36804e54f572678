//! Configuration types.

use std::path::PathBuf;

use crate::error::ConfigError;

/// Default worker pool size.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Default per-task replay buffer size.
pub const DEFAULT_EVENT_REPLAY_CAPACITY: usize = 100;

/// Per-subscriber channel capacity.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of tasks that may execute concurrently.
    pub max_workers: usize,
    /// Bound of the single-consumer result queue.
    pub result_queue_capacity: usize,
    /// Events kept per task for reconnecting observers.
    pub event_replay_capacity: usize,
    /// Events queued per subscriber before new ones are dropped for it.
    pub subscriber_capacity: usize,
    /// Backend used when a task does not name one.
    pub default_backend: String,
    /// Program and arguments for the subprocess backend.
    pub agent_command: Vec<String>,
    /// libSQL database file.
    pub db_path: PathBuf,
    /// Where task workspaces are created (defaults to a sibling of the repo root).
    pub workspaces_dir: Option<PathBuf>,
    /// Directory for rolling log files.
    pub log_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            result_queue_capacity: 256,
            event_replay_capacity: DEFAULT_EVENT_REPLAY_CAPACITY,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            default_backend: "command".to_string(),
            agent_command: Vec::new(),
            db_path: PathBuf::from("./data/agent-foundry.db"),
            workspaces_dir: None,
            log_dir: None,
        }
    }
}

impl Config {
    /// Build configuration from `AGENT_FOUNDRY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = lookup("AGENT_FOUNDRY_WORKERS") {
            config.max_workers = parse_positive("AGENT_FOUNDRY_WORKERS", &v)?;
        }
        if let Some(v) = lookup("AGENT_FOUNDRY_REPLAY") {
            config.event_replay_capacity = parse_positive("AGENT_FOUNDRY_REPLAY", &v)?;
        }
        if let Some(v) = lookup("AGENT_FOUNDRY_BACKEND") {
            config.default_backend = v;
        }
        if let Some(v) = lookup("AGENT_FOUNDRY_AGENT_CMD") {
            config.agent_command = v.split_whitespace().map(str::to_string).collect();
        }
        if let Some(v) = lookup("AGENT_FOUNDRY_DB_PATH") {
            config.db_path = PathBuf::from(v);
        }
        config.workspaces_dir = lookup("AGENT_FOUNDRY_WORKSPACES").map(PathBuf::from);
        config.log_dir = lookup("AGENT_FOUNDRY_LOG_DIR").map(PathBuf::from);

        Ok(config)
    }
}

fn parse_positive(key: &str, value: &str) -> Result<usize, ConfigError> {
    match value.trim().parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        Ok(_) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        }),
        Err(e) => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_env() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.max_workers, DEFAULT_MAX_WORKERS);
        assert_eq!(config.event_replay_capacity, 100);
        assert_eq!(config.default_backend, "command");
        assert!(config.agent_command.is_empty());
        assert!(config.workspaces_dir.is_none());
    }

    #[test]
    fn reads_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("AGENT_FOUNDRY_WORKERS", "8"),
            ("AGENT_FOUNDRY_AGENT_CMD", "my-agent --json  --fast"),
            ("AGENT_FOUNDRY_WORKSPACES", "/tmp/ws"),
        ]))
        .unwrap();
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.agent_command, vec!["my-agent", "--json", "--fast"]);
        assert_eq!(config.workspaces_dir, Some(PathBuf::from("/tmp/ws")));
    }

    #[test]
    fn rejects_zero_workers() {
        let result = Config::from_lookup(lookup(&[("AGENT_FOUNDRY_WORKERS", "0")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn rejects_non_numeric_replay() {
        let result = Config::from_lookup(lookup(&[("AGENT_FOUNDRY_REPLAY", "lots")]));
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }
}
