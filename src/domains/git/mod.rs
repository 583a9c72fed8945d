pub mod branches;
pub mod repository;
pub mod worktrees;

pub use branches::{branch_exists, delete_branch, ensure_branch_at_head};
pub use repository::{
    get_commit_hash, get_current_branch, get_default_branch, repository_has_commits,
};
pub use worktrees::{create_worktree_from_base, list_worktrees, remove_worktree};
