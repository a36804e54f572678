//! Task data model.

pub mod message;
pub mod model;

pub use message::{BlockType, ContentBlock, Message, Role, flatten_text};
pub use model::{AgentRun, BackendSession, CANCELLED_NOTE, NewTask, Task, TaskStatus, Usage};
