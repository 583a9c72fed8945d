use super::repository::get_current_branch;
use anyhow::{Result, anyhow};
use git2::build::CheckoutBuilder;
use git2::{BranchType, Repository};
use std::path::Path;

pub fn branch_exists(repo_path: &Path, branch_name: &str) -> Result<bool> {
    let repo = Repository::open(repo_path)?;
    match repo.find_branch(branch_name, BranchType::Local) {
        Ok(_) => Ok(true),
        Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(false),
        // Treat corrupted branches as non-existent
        Err(e)
            if e.code() == git2::ErrorCode::InvalidSpec
                || e.code() == git2::ErrorCode::GenericError =>
        {
            Ok(false)
        }
        Err(e) => Err(anyhow!("Error checking branch existence: {e}")),
    }
}

pub fn delete_branch(repo_path: &Path, branch_name: &str) -> Result<()> {
    let repo = Repository::open(repo_path)?;
    let mut branch = repo
        .find_branch(branch_name, BranchType::Local)
        .map_err(|e| anyhow!("Failed to delete branch {branch_name}: {e}"))?;
    branch
        .delete()
        .map_err(|e| anyhow!("Failed to delete branch {branch_name}: {e}"))?;
    Ok(())
}

/// Make sure `branch_name` exists and is checked out, bootstrapping it from
/// the current HEAD when a repository has never had that branch.
pub fn ensure_branch_at_head(repo_path: &Path, branch_name: &str) -> Result<()> {
    let repo = Repository::open(repo_path)?;

    let current_branch = get_current_branch(repo_path).unwrap_or_else(|_| "HEAD".to_string());

    if repo.find_branch(branch_name, BranchType::Local).is_ok() {
        log::info!("Branch '{branch_name}' already exists, checking out");
        checkout_branch(&repo, branch_name)?;
        return Ok(());
    }

    if current_branch != "HEAD"
        && let Ok(mut existing) = repo.find_branch(&current_branch, BranchType::Local)
    {
        log::info!("Renaming current branch '{current_branch}' to requested base '{branch_name}'");
        existing.rename(branch_name, false).map_err(|e| {
            anyhow!("Failed to rename branch '{current_branch}' to '{branch_name}': {e}")
        })?;
        checkout_branch(&repo, branch_name)?;
        return Ok(());
    }

    let head_obj = repo
        .revparse_single("HEAD")
        .map_err(|e| anyhow!("Cannot resolve HEAD commit to create branch '{branch_name}': {e}"))?;
    let head_commit = head_obj
        .peel_to_commit()
        .map_err(|e| anyhow!("HEAD is not pointing to a commit: {e}"))?;

    repo.branch(branch_name, &head_commit, false)
        .map_err(|e| anyhow!("Failed to create branch '{branch_name}': {e}"))?;
    checkout_branch(&repo, branch_name)?;

    log::info!("Bootstrapped branch '{branch_name}' from HEAD");
    Ok(())
}

fn checkout_branch(repo: &Repository, branch_name: &str) -> Result<()> {
    repo.set_head(&format!("refs/heads/{branch_name}"))
        .map_err(|e| anyhow!("Failed to update HEAD to '{branch_name}': {e}"))?;

    let mut checkout = CheckoutBuilder::new();
    checkout.force();
    repo.checkout_head(Some(&mut checkout))
        .map_err(|e| anyhow!("Failed to checkout branch '{branch_name}': {e}"))?;

    Ok(())
}
