use async_trait::async_trait;
use cadencecore::{Task, TaskContext, TaskError, TaskSignature, Value, ValueKind};
use cadenceruntime::{TaskFactory, TaskMetadata};

/// Sums a sequence of numbers
pub struct SumTask;

#[async_trait]
impl Task for SumTask {
    fn task_type(&self) -> &str {
        "math.sum"
    }

    async fn run(&self, ctx: TaskContext) -> Result<Value, TaskError> {
        let total = sum(ctx.input_array()?)?;
        ctx.events.info(format!("Total: {}", total));
        Ok(Value::Number(total))
    }
}

fn sum(items: &[Value]) -> Result<f64, TaskError> {
    items.iter().try_fold(0.0, |total, item| {
        item.as_f64()
            .map(|n| total + n)
            .ok_or_else(|| TaskError::InvalidInput {
                expected: ValueKind::Number.to_string(),
                actual: item.kind().to_string(),
            })
    })
}

pub struct SumTaskFactory;

impl TaskFactory for SumTaskFactory {
    fn create(&self) -> Result<Box<dyn Task>, TaskError> {
        Ok(Box::new(SumTask))
    }

    fn task_type(&self) -> &str {
        "math.sum"
    }

    fn signature(&self) -> TaskSignature {
        TaskSignature::new(ValueKind::Sequence, ValueKind::Number)
    }

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            description: "Sum a sequence of numbers".to_string(),
            category: "math".to_string(),
        }
    }
}
