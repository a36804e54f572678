//! Agent Foundry: parallel AI coding agents, one isolated workspace per task.

pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod store;
pub mod stream;
pub mod task;
pub mod workspace;

pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, OrchestratorDeps};
