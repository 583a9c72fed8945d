use anyhow::{Result, anyhow};
use git2::{BranchType, Repository};
use std::path::Path;

/// Branch names tried, in order, when the remote does not advertise a HEAD.
const PREFERRED_DEFAULT_BRANCHES: [&str; 4] = ["main", "master", "develop", "trunk"];

/// Resolve the branch new workspaces should be based on.
///
/// `origin/HEAD` wins when present; otherwise the first of
/// main/master/develop/trunk that exists (remote or local); otherwise "main".
pub fn get_default_branch(repo_path: &Path) -> Result<String> {
    let repo = Repository::open(repo_path)?;

    if let Ok(reference) = repo.find_reference("refs/remotes/origin/HEAD")
        && let Some(target) = reference.symbolic_target()
        && let Some(name) = target.strip_prefix("refs/remotes/origin/")
    {
        log::debug!("Default branch from origin/HEAD: {name}");
        return Ok(name.to_string());
    }

    let mut known = Vec::new();

    if let Ok(remote_branches) = repo.branches(Some(BranchType::Remote)) {
        for (branch, _) in remote_branches.flatten() {
            if let Ok(Some(name)) = branch.name()
                && let Some(short) = name.strip_prefix("origin/")
                && short != "HEAD"
            {
                known.push(short.to_string());
            }
        }
    }

    if let Ok(local_branches) = repo.branches(Some(BranchType::Local)) {
        for (branch, _) in local_branches.flatten() {
            if let Ok(Some(name)) = branch.name() {
                known.push(name.to_string());
            }
        }
    }

    for candidate in PREFERRED_DEFAULT_BRANCHES {
        if known.iter().any(|name| name == candidate) {
            return Ok(candidate.to_string());
        }
    }

    Ok("main".to_string())
}

pub fn get_current_branch(repo_path: &Path) -> Result<String> {
    let repo = Repository::open(repo_path)?;
    let head = repo.head()?;
    head.shorthand()
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow!("HEAD is not on a named branch"))
}

pub fn get_commit_hash(repo_path: &Path, reference: &str) -> Result<String> {
    let repo = Repository::open(repo_path)?;
    let object = repo
        .revparse_single(reference)
        .map_err(|e| anyhow!("Failed to resolve '{reference}': {e}"))?;
    let commit = object
        .peel_to_commit()
        .map_err(|e| anyhow!("'{reference}' does not point at a commit: {e}"))?;
    Ok(commit.id().to_string())
}

pub fn repository_has_commits(repo_path: &Path) -> Result<bool> {
    let repo = Repository::open(repo_path)?;
    match repo.head() {
        Ok(head) => Ok(head.target().is_some()),
        Err(e) if e.code() == git2::ErrorCode::UnbornBranch => Ok(false),
        Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(false),
        Err(e) => Err(anyhow!("Failed to read HEAD: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;
    use tempfile::TempDir;

    fn git(repo: &Path, args: &[&str]) {
        let out = Command::new("git")
            .args(args)
            .current_dir(repo)
            .output()
            .unwrap();
        assert!(
            out.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&out.stderr)
        );
    }

    fn init_repo(initial_branch: &str) -> (TempDir, std::path::PathBuf) {
        let temp = TempDir::new().unwrap();
        let path = temp.path().to_path_buf();
        git(&path, &["init", &format!("--initial-branch={initial_branch}")]);
        git(&path, &["config", "user.email", "test@example.com"]);
        git(&path, &["config", "user.name", "Test User"]);
        git(&path, &["commit", "--allow-empty", "-m", "init"]);
        (temp, path)
    }

    #[test]
    fn default_branch_prefers_main_over_master() {
        let (_temp, path) = init_repo("master");
        git(&path, &["branch", "main"]);

        assert_eq!(get_default_branch(&path).unwrap(), "main");
    }

    #[test]
    fn default_branch_falls_back_to_master() {
        let (_temp, path) = init_repo("master");

        assert_eq!(get_default_branch(&path).unwrap(), "master");
    }

    #[test]
    fn default_branch_honors_origin_head_over_preference_order() {
        let (_origin_temp, origin_path) = init_repo("develop");
        git(&origin_path, &["branch", "main"]);
        git(&origin_path, &["branch", "master"]);

        let clone_temp = TempDir::new().unwrap();
        let clone_path = clone_temp.path().join("clone");
        let out = Command::new("git")
            .args([
                "clone",
                origin_path.to_str().unwrap(),
                clone_path.to_str().unwrap(),
            ])
            .output()
            .unwrap();
        assert!(out.status.success());

        // origin/HEAD in the clone points at the origin's checked-out branch.
        assert_eq!(get_default_branch(&clone_path).unwrap(), "develop");
    }

    #[test]
    fn default_branch_is_main_when_nothing_matches() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().to_path_buf();
        git(&path, &["init", "--initial-branch=feature-x"]);

        // No commits, no remotes, no preferred branches.
        assert_eq!(get_default_branch(&path).unwrap(), "main");
    }

    #[test]
    fn commit_hash_resolves_head_and_branch_identically() {
        let (_temp, path) = init_repo("main");
        let by_branch = get_commit_hash(&path, "main").unwrap();
        let by_head = get_commit_hash(&path, "HEAD").unwrap();
        assert_eq!(by_branch, by_head);
        assert_eq!(by_branch.len(), 40);
        assert!(get_commit_hash(&path, "no-such-branch").is_err());
    }

    #[test]
    fn repository_has_commits_detects_unborn_head() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().to_path_buf();
        git(&path, &["init"]);
        assert!(!repository_has_commits(&path).unwrap());

        git(&path, &["config", "user.email", "test@example.com"]);
        git(&path, &["config", "user.name", "Test User"]);
        git(&path, &["commit", "--allow-empty", "-m", "init"]);
        assert!(repository_has_commits(&path).unwrap());
    }
}
