pub mod domains;
pub mod errors;
pub mod events;
pub mod infrastructure;
pub mod shared;

pub use domains::agents::{AgentConnector, AgentSession, AgentSessionOptions};
pub use domains::sessions::{
    FileStreamService, SessionManager, StreamEntry, StreamHeaders, StreamProducer, StreamReader,
    StreamService, StreamWatcher,
};
pub use domains::terminal::{HistoryReadResult, TabMetadata, TerminalHistoryStore};
pub use domains::workspaces::{
    InitStep, JobSnapshot, NoSetup, ProjectLocks, WorkspaceBootstrapper, WorkspaceInitManager,
    WorkspaceSetup, WorkspaceSpec,
};
pub use errors::CoordinatorError;
pub use events::{CoordinatorEvent, EventBus, EventEnvelope};
