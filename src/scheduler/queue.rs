//! The bounded async work queue (spec.md §4.2 "Asynchronous path").

use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::Function;

pub struct WorkItem {
    pub function: Function,
    pub execution_id: Uuid,
    pub input: Value,
    pub context: Option<Value>,
}

pub fn channel(capacity: usize) -> (mpsc::Sender<WorkItem>, mpsc::Receiver<WorkItem>) {
    mpsc::channel(capacity)
}
