//! In-VM Agent collaborator (spec.md §6): wire format and HTTP client for
//! dispatching a function invocation and receiving its out-of-band result.

pub mod client;
pub mod protocol;

pub use client::AgentClient;
pub use protocol::{DispatchPayload, ResultCallback};

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent unreachable: {0}")]
    Unreachable(String),
    #[error("agent returned non-2xx status {0}")]
    BadStatus(u16),
}

pub type AgentResult<T> = std::result::Result<T, AgentError>;
