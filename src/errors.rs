use serde::Serialize;
use std::fmt;

/// Errors that cross the embedding boundary as data rather than as panics or
/// opaque strings. The UI layer renders retry/delete affordances off these.
#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type", content = "data")]
pub enum CoordinatorError {
    WorkspaceNotFound {
        workspace_id: String,
    },
    SessionNotFound {
        session_id: String,
    },
    SessionAlreadyExists {
        session_id: String,
    },
    GitOperationFailed {
        operation: String,
        message: String,
    },
    StreamUnavailable {
        session_id: String,
        message: String,
    },
    InvalidInput {
        field: String,
        message: String,
    },
    IoError {
        operation: String,
        path: String,
        message: String,
    },
}

impl CoordinatorError {
    pub fn git(operation: &str, error: impl ToString) -> Self {
        CoordinatorError::GitOperationFailed {
            operation: operation.to_string(),
            message: error.to_string(),
        }
    }

    pub fn io(operation: &str, path: &std::path::Path, error: impl ToString) -> Self {
        CoordinatorError::IoError {
            operation: operation.to_string(),
            path: path.display().to_string(),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorError::WorkspaceNotFound { workspace_id } => {
                write!(f, "Workspace not found: {workspace_id}")
            }
            CoordinatorError::SessionNotFound { session_id } => {
                write!(f, "Session not found: {session_id}")
            }
            CoordinatorError::SessionAlreadyExists { session_id } => {
                write!(f, "Session already exists: {session_id}")
            }
            CoordinatorError::GitOperationFailed { operation, message } => {
                write!(f, "Git operation '{operation}' failed: {message}")
            }
            CoordinatorError::StreamUnavailable {
                session_id,
                message,
            } => {
                write!(f, "Durable stream unavailable for '{session_id}': {message}")
            }
            CoordinatorError::InvalidInput { field, message } => {
                write!(f, "Invalid input for '{field}': {message}")
            }
            CoordinatorError::IoError {
                operation,
                path,
                message,
            } => {
                write!(f, "IO error during '{operation}' on '{path}': {message}")
            }
        }
    }
}

impl std::error::Error for CoordinatorError {}
