//! Wire structs for the control-plane/in-VM-agent boundary (spec.md §6).
//! Field names and shapes are fixed by the spec; do not rename without
//! restating the wire format.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use crate::models::Function;

/// POSTed by the control plane to the agent's `/execute` endpoint (port
/// 8081 by convention; the actual port lives on the VM's IP address).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchPayload {
    pub function_id: Uuid,
    pub name: String,
    pub code: String,
    pub requirements: Option<String>,
    pub config: Option<String>,
    pub runtime: String,
    pub entry_point: String,
    pub environment: HashMap<String, String>,
    pub request_id: Uuid,
    pub timeout: i64,
    pub memory: i64,
    pub version: String,
    pub event: Value,
    pub context: Value,
}

impl DispatchPayload {
    pub fn for_invocation(
        function: &Function,
        execution_id: Uuid,
        event: Value,
        context: Option<Value>,
    ) -> Self {
        Self {
            function_id: function.id,
            name: function.name.clone(),
            code: function.code.clone(),
            requirements: function.requirements.clone(),
            config: function.config.clone(),
            runtime: function.runtime.clone(),
            entry_point: Function::DEFAULT_ENTRY_POINT.to_string(),
            environment: HashMap::new(),
            request_id: execution_id,
            timeout: function.timeout_secs,
            memory: function.memory_mib,
            version: function.version.to_string(),
            event,
            context: context.unwrap_or_else(|| Value::Object(Default::default())),
        }
    }
}

/// POSTed by the agent to the control plane's `/api/results` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultCallback {
    pub request_id: Uuid,
    pub function_id: Uuid,
    pub status_code: u16,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub duration_ms: i64,
    #[serde(default)]
    pub memory_usage_kb: Option<i64>,
}

impl ResultCallback {
    pub fn succeeded(&self) -> bool {
        self.status_code == 200
    }
}
