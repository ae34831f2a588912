use async_trait::async_trait;
use cadencecore::{Task, TaskContext, TaskError, Value};
use cadenceruntime::{TaskFactory, TaskMetadata};

/// Logs its input and passes it through unchanged
pub struct DebugTask;

#[async_trait]
impl Task for DebugTask {
    fn task_type(&self) -> &str {
        "debug.log"
    }

    async fn run(&self, ctx: TaskContext) -> Result<Value, TaskError> {
        ctx.events.info(format!("DEBUG: {}", ctx.input));
        for (key, value) in ctx.params.iter() {
            ctx.events.info(format!("  {}: {}", key, value));
        }
        Ok(ctx.input)
    }
}

pub struct DebugTaskFactory;

impl TaskFactory for DebugTaskFactory {
    fn create(&self) -> Result<Box<dyn Task>, TaskError> {
        Ok(Box::new(DebugTask))
    }

    fn task_type(&self) -> &str {
        "debug.log"
    }

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            description: "Logs input values for debugging".to_string(),
            category: "debug".to_string(),
        }
    }
}
