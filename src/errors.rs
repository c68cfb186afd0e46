use std::io;
use thiserror::Error;

/// Crate-wide error taxonomy. Every component boundary returns one of
/// these; the CLI maps them to process exit codes.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("certificate error: {0}")]
    Cert(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("authentication error: {0}")]
    Auth(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("pane error: {0}")]
    Pane(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("agent is shutting down")]
    Shutdown,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl AgentError {
    /// Exit code contract: 0 success, 1 configuration, 2 certificate,
    /// 3 anything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            AgentError::Config(_) => 1,
            AgentError::Cert(_) => 2,
            _ => 3,
        }
    }
}

pub type Result<T> = std::result::Result<T, AgentError>;
