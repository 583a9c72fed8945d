use super::branches::ensure_branch_at_head;
use super::repository::get_commit_hash;
use anyhow::{Result, anyhow};
use git2::{BranchType, Repository, WorktreeAddOptions, WorktreePruneOptions};
use std::path::{Path, PathBuf};

/// Create a worktree for `branch_name` rooted at the tip of `base_branch`.
///
/// Concurrent worktree mutations on one repository corrupt git's lock files,
/// so callers must hold the owning project's lock across this call.
pub fn create_worktree_from_base(
    repo_path: &Path,
    branch_name: &str,
    worktree_path: &Path,
    base_branch: &str,
) -> Result<()> {
    let base_commit_hash = match get_commit_hash(repo_path, base_branch) {
        Ok(hash) => hash,
        Err(err) => {
            log::warn!(
                "Base branch '{base_branch}' missing when creating worktree: {err}. Attempting to bootstrap from HEAD."
            );
            ensure_branch_at_head(repo_path, base_branch)?;
            get_commit_hash(repo_path, base_branch).map_err(|e| {
                anyhow!(
                    "Base branch '{base_branch}' does not exist in the repository after bootstrap attempt: {e}"
                )
            })?
        }
    };

    log::info!("Creating worktree from commit {base_commit_hash} ({base_branch})");

    if let Some(parent) = worktree_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let repo = Repository::open(repo_path)?;

    // A stale branch from an earlier attempt blocks the worktree add; replace it.
    if let Ok(mut branch) = repo.find_branch(branch_name, BranchType::Local) {
        log::info!("Deleting existing branch: {branch_name}");
        branch.delete()?;
    }

    let base_oid = git2::Oid::from_str(&base_commit_hash)?;
    let base_commit = repo.find_commit(base_oid)?;

    let new_branch = repo.branch(branch_name, &base_commit, false)?;
    let branch_ref = new_branch.into_reference();

    let mut opts = WorktreeAddOptions::new();
    opts.reference(Some(&branch_ref));

    let _worktree = repo.worktree(
        worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch_name),
        worktree_path,
        Some(&opts),
    )?;

    log::info!(
        "Successfully created worktree at: {}",
        worktree_path.display()
    );
    Ok(())
}

pub fn remove_worktree(repo_path: &Path, worktree_path: &Path) -> Result<()> {
    let repo = Repository::open(repo_path)?;

    // Compare canonicalized paths; macOS tends to hand back /private aliases.
    let canonical_target_path = worktree_path
        .canonicalize()
        .unwrap_or_else(|_| worktree_path.to_path_buf());

    let worktrees = repo.worktrees()?;
    for wt_name in worktrees.iter().flatten() {
        if let Ok(wt) = repo.find_worktree(wt_name) {
            let wt_path = wt.path();
            let canonical_wt_path = wt_path
                .canonicalize()
                .unwrap_or_else(|_| wt_path.to_path_buf());
            if canonical_wt_path == canonical_target_path || wt_path == worktree_path {
                // Remove the directory first; pruning only succeeds once the
                // worktree is invalid.
                if worktree_path.exists()
                    && let Err(e) = std::fs::remove_dir_all(worktree_path)
                {
                    return Err(anyhow!("Failed to remove worktree directory: {e}"));
                }

                if let Err(e) = wt.prune(Some(&mut WorktreePruneOptions::new())) {
                    log::warn!("Failed to prune worktree from git registry: {e}");
                }
                return Ok(());
            }
        }
    }

    if worktree_path.exists() {
        std::fs::remove_dir_all(worktree_path)?;
        Ok(())
    } else {
        Err(anyhow!("Worktree not found: {worktree_path:?}"))
    }
}

pub fn list_worktrees(repo_path: &Path) -> Result<Vec<PathBuf>> {
    let repo = Repository::open(repo_path)?;
    let mut worktree_paths = Vec::new();

    if let Some(workdir) = repo.workdir() {
        worktree_paths.push(workdir.to_path_buf());
    }

    let worktrees = repo.worktrees()?;
    for wt_name in worktrees.iter().flatten() {
        if let Ok(wt) = repo.find_worktree(wt_name) {
            worktree_paths.push(wt.path().to_path_buf());
        }
    }

    Ok(worktree_paths)
}

#[cfg(test)]
pub fn is_worktree_registered(repo_path: &Path, worktree_path: &Path) -> Result<bool> {
    let repo = Repository::open(repo_path)?;
    let worktrees = repo.worktrees()?;

    let canonical_worktree_path = worktree_path
        .canonicalize()
        .unwrap_or_else(|_| worktree_path.to_path_buf());

    for wt_name in worktrees.iter().flatten() {
        if let Ok(wt) = repo.find_worktree(wt_name) {
            let wt_path = wt.path();
            let canonical_wt_path = wt_path
                .canonicalize()
                .unwrap_or_else(|_| wt_path.to_path_buf());
            if canonical_wt_path == canonical_worktree_path {
                return Ok(true);
            }
        }
    }

    Ok(false)
}
