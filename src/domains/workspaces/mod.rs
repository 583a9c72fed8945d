pub mod bootstrapper;
pub mod init_manager;
pub mod locks;

pub use bootstrapper::{NoSetup, WorkspaceBootstrapper, WorkspaceSetup, WorkspaceSpec};
pub use init_manager::{InitStep, JobSnapshot, WorkspaceInitManager};
pub use locks::ProjectLocks;
