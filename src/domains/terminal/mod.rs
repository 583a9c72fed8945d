pub mod history;

pub use history::{
    HistoryEntry, HistoryReadResult, TAIL_READ_CAP, TabMetadata, TerminalHistorySession,
    TerminalHistoryStore,
};
