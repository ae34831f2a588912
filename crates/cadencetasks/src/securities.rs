use async_trait::async_trait;
use cadencecore::{Task, TaskContext, TaskError, TaskSignature, Value, ValueKind};
use cadenceruntime::{TaskFactory, TaskMetadata};
use std::collections::HashMap;

pub const API_URL_VAR: &str = "CADENCE_API_URL";

/// Places a (simulated) securities order
pub struct BuySecuritiesTask;

#[async_trait]
impl Task for BuySecuritiesTask {
    fn task_type(&self) -> &str {
        "securities.buy"
    }

    async fn run(&self, ctx: TaskContext) -> Result<Value, TaskError> {
        ctx.events.info("Buying securities");

        let mut order = HashMap::new();
        order.insert("status".to_string(), Value::from("submitted"));
        if let Some(api) = ctx.env.get(API_URL_VAR) {
            order.insert("api".to_string(), Value::from(api.as_str()));
        }
        if !ctx.input.is_null() {
            order.insert("request".to_string(), ctx.input.clone());
        }
        Ok(Value::Object(order))
    }
}

pub struct BuySecuritiesTaskFactory;

impl TaskFactory for BuySecuritiesTaskFactory {
    fn create(&self) -> Result<Box<dyn Task>, TaskError> {
        Ok(Box::new(BuySecuritiesTask))
    }

    fn task_type(&self) -> &str {
        "securities.buy"
    }

    fn signature(&self) -> TaskSignature {
        TaskSignature::new(ValueKind::Any, ValueKind::Mapping)
    }

    fn metadata(&self) -> TaskMetadata {
        TaskMetadata {
            description: "Handle buying of securities".to_string(),
            category: "trading".to_string(),
        }
    }
}
