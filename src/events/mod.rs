//! Task event pub/sub for live observers.

pub mod bus;
pub mod model;

pub use bus::{EventBus, SubscriberId, Subscription};
pub use model::{Event, EventType, LogPayload, StatusPayload};
