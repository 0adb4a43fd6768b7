use std::sync::Arc;

use crate::db::Db;
use crate::reconciler::Reconciler;
use crate::registry::FunctionRegistry;
use crate::scheduler::Scheduler;
use crate::vm::VmPoolManager;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub registry: Arc<FunctionRegistry>,
    pub pool: Arc<VmPoolManager>,
    pub scheduler: Arc<Scheduler>,
    pub reconciler: Arc<Reconciler>,
    pub api_token: Option<Arc<str>>,
}
