use crate::{RunId, RunState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted while runs are scheduled and executed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RunEvent {
    RunScheduled {
        run_id: RunId,
        deployment: String,
        manual: bool,
        timestamp: DateTime<Utc>,
    },
    RunStarted {
        run_id: RunId,
        deployment: String,
        timestamp: DateTime<Utc>,
    },
    StepStarted {
        run_id: RunId,
        step: String,
        task: String,
        elements: Option<usize>,
        timestamp: DateTime<Utc>,
    },
    AttemptFailed {
        run_id: RunId,
        step: String,
        element: Option<usize>,
        attempt: u32,
        error: String,
        will_retry: bool,
        timestamp: DateTime<Utc>,
    },
    StepCompleted {
        run_id: RunId,
        step: String,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    RunFinished {
        run_id: RunId,
        deployment: String,
        state: RunState,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    TaskLog {
        run_id: RunId,
        step: String,
        element: Option<usize>,
        line: TaskLogLine,
        timestamp: DateTime<Utc>,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            RunEvent::RunScheduled { run_id, .. }
            | RunEvent::RunStarted { run_id, .. }
            | RunEvent::StepStarted { run_id, .. }
            | RunEvent::AttemptFailed { run_id, .. }
            | RunEvent::StepCompleted { run_id, .. }
            | RunEvent::RunFinished { run_id, .. }
            | RunEvent::TaskLog { run_id, .. } => *run_id,
        }
    }
}

/// Lines a task prints while running
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "level")]
pub enum TaskLogLine {
    Info { message: String },
    Warning { message: String },
    Progress { percent: f64, message: Option<String> },
}

/// Event emitter handed to tasks through their context
#[derive(Clone)]
pub struct EventEmitter {
    run_id: RunId,
    step: String,
    element: Option<usize>,
    sender: broadcast::Sender<RunEvent>,
}

impl EventEmitter {
    pub fn new(run_id: RunId, step: impl Into<String>, sender: broadcast::Sender<RunEvent>) -> Self {
        Self {
            run_id,
            step: step.into(),
            element: None,
            sender,
        }
    }

    /// Emitter scoped to one element of a mapped step
    pub fn for_element(&self, element: usize) -> Self {
        Self {
            element: Some(element),
            ..self.clone()
        }
    }

    pub fn emit(&self, line: TaskLogLine) {
        let _ = self.sender.send(RunEvent::TaskLog {
            run_id: self.run_id,
            step: self.step.clone(),
            element: self.element,
            line,
            timestamp: Utc::now(),
        });
    }

    /// Log an info line; mirrored to `tracing`.
    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(run_id = %self.run_id, step = %self.step, element = ?self.element, "{}", message);
        self.emit(TaskLogLine::Info { message });
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!(run_id = %self.run_id, step = %self.step, element = ?self.element, "{}", message);
        self.emit(TaskLogLine::Warning { message });
    }

    pub fn progress(&self, percent: f64, message: Option<String>) {
        self.emit(TaskLogLine::Progress { percent, message });
    }
}

/// Process-wide run event bus
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
}

impl EventBus {
    /// A capacity of 0 is raised to 1.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    pub fn create_emitter(&self, run_id: RunId, step: impl Into<String>) -> EventEmitter {
        EventEmitter::new(run_id, step, self.sender.clone())
    }
}
