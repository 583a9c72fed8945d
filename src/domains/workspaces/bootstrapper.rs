use super::init_manager::{InitStep, WorkspaceInitManager};
use crate::domains::git;
use crate::errors::CoordinatorError;
use crate::infrastructure::events::{CoordinatorEvent, EventBus};
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use log::{info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Hooks the embedding layer supplies for the install and setup-script
/// phases. The defaults are no-ops so a bare checkout still initializes.
#[async_trait]
pub trait WorkspaceSetup: Send + Sync {
    async fn install(&self, worktree: &Path) -> Result<()> {
        let _ = worktree;
        Ok(())
    }

    async fn run_setup_script(&self, worktree: &Path) -> Result<()> {
        let _ = worktree;
        Ok(())
    }
}

pub struct NoSetup;

impl WorkspaceSetup for NoSetup {}

#[derive(Debug, Clone)]
pub struct WorkspaceSpec {
    pub workspace_id: String,
    pub project_id: String,
    pub repo_path: PathBuf,
    pub branch: String,
    /// None means "resolve the repository's default branch".
    pub base_branch: Option<String>,
    pub worktree_path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceRemovedPayload {
    pub workspace_id: String,
}

/// Runs one workspace initialization attempt end to end, holding the project
/// lock across every git mutation and finalizing the job on every exit path.
pub struct WorkspaceBootstrapper {
    init: Arc<WorkspaceInitManager>,
    setup: Arc<dyn WorkspaceSetup>,
    events: EventBus,
}

impl WorkspaceBootstrapper {
    pub fn new(
        init: Arc<WorkspaceInitManager>,
        setup: Arc<dyn WorkspaceSetup>,
        events: EventBus,
    ) -> Self {
        Self {
            init,
            setup,
            events,
        }
    }

    pub async fn initialize(&self, spec: &WorkspaceSpec) -> Result<PathBuf> {
        info!(
            "Initializing workspace '{}' in project '{}'",
            spec.workspace_id, spec.project_id
        );
        self.init.start_job(&spec.workspace_id, &spec.project_id);
        self.init.acquire_project_lock(&spec.project_id).await;

        let outcome = self.run_steps(spec).await;

        let result = match outcome {
            Ok(path) => {
                self.init
                    .update_progress(&spec.workspace_id, InitStep::Ready, "Workspace ready", None);
                Ok(path)
            }
            Err(err) => {
                if self.init.is_cancellation_requested(&spec.workspace_id) {
                    self.cleanup_partial_worktree(spec).await;
                    self.init.update_progress(
                        &spec.workspace_id,
                        InitStep::Failed,
                        "Initialization cancelled",
                        Some("cancelled".to_string()),
                    );
                } else {
                    // Side-effect flags stay intact so the retry/delete path
                    // can decide what to clean up.
                    self.init.update_progress(
                        &spec.workspace_id,
                        InitStep::Failed,
                        "Initialization failed",
                        Some(err.to_string()),
                    );
                }
                Err(err)
            }
        };

        self.init.release_project_lock(&spec.project_id).await;
        self.init.finalize_job(&spec.workspace_id);
        result
    }

    async fn run_steps(&self, spec: &WorkspaceSpec) -> Result<PathBuf> {
        self.check_cancelled(spec)?;

        self.init.update_progress(
            &spec.workspace_id,
            InitStep::Cloning,
            "Creating worktree",
            None,
        );

        let base_branch = self.resolve_base_branch(spec).await?;
        self.create_worktree(spec, &base_branch).await?;
        self.init.mark_worktree_created(&spec.workspace_id);

        self.check_cancelled(spec)?;

        self.init.update_progress(
            &spec.workspace_id,
            InitStep::Installing,
            "Installing dependencies",
            None,
        );
        self.setup
            .install(&spec.worktree_path)
            .await
            .context("Dependency install failed")?;

        self.check_cancelled(spec)?;

        self.init.update_progress(
            &spec.workspace_id,
            InitStep::RunningSetup,
            "Running setup script",
            None,
        );
        self.setup
            .run_setup_script(&spec.worktree_path)
            .await
            .context("Setup script failed")?;

        self.check_cancelled(spec)?;

        Ok(spec.worktree_path.clone())
    }

    /// Cancellation is cooperative: this is polled between every await.
    fn check_cancelled(&self, spec: &WorkspaceSpec) -> Result<()> {
        if self.init.is_cancellation_requested(&spec.workspace_id) {
            Err(anyhow!(
                "Initialization cancelled for workspace '{}'",
                spec.workspace_id
            ))
        } else {
            Ok(())
        }
    }

    async fn resolve_base_branch(&self, spec: &WorkspaceSpec) -> Result<String> {
        if let Some(base) = &spec.base_branch {
            let trimmed = base.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.to_string());
            }
            warn!("Explicit base branch was empty, falling back to branch detection");
        }

        let repo_path = spec.repo_path.clone();
        tokio::task::spawn_blocking(move || git::get_default_branch(&repo_path))
            .await
            .map_err(|e| anyhow!("Task join error: {e}"))?
            .map_err(|e| anyhow!(CoordinatorError::git("get_default_branch", e)))
    }

    async fn create_worktree(&self, spec: &WorkspaceSpec, base_branch: &str) -> Result<()> {
        let repo_path = spec.repo_path.clone();
        let branch = spec.branch.clone();
        let worktree_path = spec.worktree_path.clone();
        let base_branch = base_branch.to_string();

        tokio::task::spawn_blocking(move || {
            git::create_worktree_from_base(&repo_path, &branch, &worktree_path, &base_branch)
        })
        .await
        .map_err(|e| anyhow!("Task join error: {e}"))?
        .map_err(|e| anyhow!(CoordinatorError::git("create_worktree", e)))
    }

    async fn cleanup_partial_worktree(&self, spec: &WorkspaceSpec) {
        if !self.init.was_worktree_created(&spec.workspace_id) {
            return;
        }
        let repo_path = spec.repo_path.clone();
        let worktree_path = spec.worktree_path.clone();
        let workspace_id = spec.workspace_id.clone();

        let removed = tokio::task::spawn_blocking(move || {
            git::remove_worktree(&repo_path, &worktree_path)
        })
        .await;

        match removed {
            Ok(Ok(())) => info!("Removed partially created worktree for '{workspace_id}'"),
            Ok(Err(e)) => warn!("Failed to remove partial worktree for '{workspace_id}': {e}"),
            Err(e) => warn!("Worktree cleanup task failed for '{workspace_id}': {e}"),
        }
    }

    /// Delete a workspace's worktree. Waits out any in-flight init and takes
    /// the same project lock, so a worktree is never deleted mid-creation.
    pub async fn delete_workspace(&self, spec: &WorkspaceSpec) -> Result<()> {
        self.init.wait_for_init(&spec.workspace_id).await;
        self.init.acquire_project_lock(&spec.project_id).await;

        let result = {
            let repo_path = spec.repo_path.clone();
            let worktree_path = spec.worktree_path.clone();
            if worktree_path.exists() {
                tokio::task::spawn_blocking(move || {
                    git::remove_worktree(&repo_path, &worktree_path)
                })
                .await
                .map_err(|e| anyhow!("Task join error: {e}"))?
                .map_err(|e| anyhow!(CoordinatorError::git("remove_worktree", e)))
            } else {
                warn!(
                    "Worktree path missing, skipping removal: {}",
                    spec.worktree_path.display()
                );
                Ok(())
            }
        };

        if result.is_ok() {
            self.init.clear_job(&spec.workspace_id);
            self.events.publish(
                CoordinatorEvent::WorkspaceRemoved,
                &WorkspaceRemovedPayload {
                    workspace_id: spec.workspace_id.clone(),
                },
            );
        }

        self.init.release_project_lock(&spec.project_id).await;
        result
    }
}
