pub mod agents;
pub mod git;
pub mod sessions;
pub mod terminal;
pub mod workspaces;
