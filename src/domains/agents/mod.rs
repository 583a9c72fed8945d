use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;

/// Launch parameters for an agent conversation.
#[derive(Debug, Clone, Default)]
pub struct AgentSessionOptions {
    pub cwd: PathBuf,
    pub model: Option<String>,
}

/// One live agent conversation. Implementations wrap whatever transport the
/// agent speaks (subprocess, socket, SDK client).
#[async_trait]
pub trait AgentSession: Send + Sync {
    /// Submit a user message, starting a new turn.
    async fn send(&self, text: &str) -> Result<()>;

    /// Next event of the current turn as raw JSON. `Ok(None)` means the turn
    /// completed. Events carrying a `session_id` field double as resume
    /// tokens.
    async fn next_event(&self) -> Result<Option<Value>>;

    async fn close(&self) -> Result<()>;
}

/// Factory for agent sessions.
#[async_trait]
pub trait AgentConnector: Send + Sync {
    async fn create_session(&self, options: &AgentSessionOptions) -> Result<Box<dyn AgentSession>>;

    /// Reattach to a previous conversation using a token captured from its
    /// event stream.
    async fn resume_session(
        &self,
        resume_token: &str,
        options: &AgentSessionOptions,
    ) -> Result<Box<dyn AgentSession>>;
}
