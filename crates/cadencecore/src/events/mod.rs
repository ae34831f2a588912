mod base;

pub use base::{EventBus, EventEmitter, RunEvent, TaskLogLine};
