//! Backend stream events and message reconstruction.

pub mod assembler;
pub mod event;

pub use assembler::{AssembledMessage, RAW_INPUT_KEY, StreamAssembler};
pub use event::{StreamEvent, StreamEventKind};
