//! HTTP client for dispatching invocations to the in-VM agent (spec.md §4.2
//! step 5, §6). The agent listens on port 8081 on the VM's assigned IP.

use std::net::Ipv4Addr;
use std::time::Duration;

use log::warn;
use reqwest::Client;

use super::{AgentError, AgentResult, DispatchPayload};

const AGENT_PORT: u16 = 8081;

pub struct AgentClient {
    http: Client,
}

impl AgentClient {
    /// `timeout` is the function's declared timeout plus the 5-second
    /// dispatch buffer (spec.md §4.2 step 5).
    pub fn new(timeout: Duration) -> Self {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client builder should never fail with only a timeout set");
        Self { http }
    }

    pub async fn dispatch(&self, vm_ip: Ipv4Addr, payload: &DispatchPayload) -> AgentResult<()> {
        let url = format!("http://{vm_ip}:{AGENT_PORT}/execute");
        let response = self
            .http
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| AgentError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            warn!("agent at {vm_ip} rejected dispatch for {}: {status}", payload.request_id);
            return Err(AgentError::BadStatus(status));
        }
        Ok(())
    }
}
