use super::locks::ProjectLocks;
use crate::infrastructure::events::{CoordinatorEvent, EventBus};
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

pub const DEFAULT_READY_TTL: Duration = Duration::from_secs(120);
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InitStep {
    Pending,
    Cloning,
    Installing,
    RunningSetup,
    Ready,
    Failed,
}

impl InitStep {
    pub fn is_terminal(self) -> bool {
        matches!(self, InitStep::Ready | InitStep::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            InitStep::Pending => 0,
            InitStep::Cloning => 1,
            InitStep::Installing => 2,
            InitStep::RunningSetup => 3,
            InitStep::Ready => 4,
            InitStep::Failed => 5,
        }
    }

    /// Steps only move forward; `Failed` is reachable from any non-terminal
    /// step, and terminal steps never transition again.
    pub fn can_transition(self, next: InitStep) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            InitStep::Failed | InitStep::Ready => true,
            _ => next.rank() >= self.rank(),
        }
    }
}

#[derive(Debug, Clone)]
struct Job {
    workspace_id: String,
    project_id: String,
    step: InitStep,
    message: String,
    error: Option<String>,
    cancelled: bool,
    worktree_created: bool,
    attempt_id: Uuid,
    updated_at: DateTime<Utc>,
}

/// Full job state published on every progress change. Subscribers replace
/// their cached copy; there is nothing incremental to merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub workspace_id: String,
    pub project_id: String,
    pub step: InitStep,
    pub message: String,
    pub error: Option<String>,
    pub cancelled: bool,
    pub worktree_created: bool,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            workspace_id: self.workspace_id.clone(),
            project_id: self.project_id.clone(),
            step: self.step,
            message: self.message.clone(),
            error: self.error.clone(),
            cancelled: self.cancelled,
            worktree_created: self.worktree_created,
            updated_at: self.updated_at,
        }
    }
}

/// Tracks one initialization job per workspace id.
///
/// All state is in-memory; a process restart mid-init loses it by design, and
/// the embedding layer surfaces "interrupted" for workspaces it knows were
/// mid-setup. Construct once and pass by reference.
pub struct WorkspaceInitManager {
    // Arc so the ready-TTL cleanup task can hold the map past &self.
    jobs: Arc<DashMap<String, Job>>,
    // Cancellations live outside the job record so a request issued after the
    // record was cleared (race) stays observable until clear_job.
    cancellations: DashSet<String>,
    done_signals: DashMap<String, watch::Sender<bool>>,
    locks: ProjectLocks,
    events: EventBus,
    ready_ttl: Duration,
}

impl WorkspaceInitManager {
    pub fn new(events: EventBus) -> Self {
        Self::with_ready_ttl(events, DEFAULT_READY_TTL)
    }

    pub fn with_ready_ttl(events: EventBus, ready_ttl: Duration) -> Self {
        Self {
            jobs: Arc::new(DashMap::new()),
            cancellations: DashSet::new(),
            done_signals: DashMap::new(),
            locks: ProjectLocks::new(),
            events,
            ready_ttl,
        }
    }

    /// Begin tracking an init attempt. An existing job for the workspace is
    /// discarded: the new attempt wins, and any prior cancellation request is
    /// considered consumed.
    pub fn start_job(&self, workspace_id: &str, project_id: &str) {
        if self.jobs.contains_key(workspace_id) {
            warn!("Replacing existing init job for workspace '{workspace_id}'");
        }
        self.cancellations.remove(workspace_id);

        let (tx, _rx) = watch::channel(false);
        self.done_signals.insert(workspace_id.to_string(), tx);

        let job = Job {
            workspace_id: workspace_id.to_string(),
            project_id: project_id.to_string(),
            step: InitStep::Pending,
            message: "Preparing workspace".to_string(),
            error: None,
            cancelled: false,
            worktree_created: false,
            attempt_id: Uuid::new_v4(),
            updated_at: Utc::now(),
        };
        let snapshot = job.snapshot();
        self.jobs.insert(workspace_id.to_string(), job);
        self.events
            .publish(CoordinatorEvent::InitProgress, &snapshot);
    }

    /// Replace step/message/error and republish the snapshot. Backward
    /// transitions are rejected: callers racing a retry must not drag a job
    /// out of a terminal step.
    pub fn update_progress(
        &self,
        workspace_id: &str,
        step: InitStep,
        message: &str,
        error: Option<String>,
    ) {
        let snapshot = {
            let Some(mut job) = self.jobs.get_mut(workspace_id) else {
                warn!("Progress update for unknown workspace '{workspace_id}' ignored");
                return;
            };
            if !job.step.can_transition(step) && job.step != step {
                warn!(
                    "Rejecting init step change {:?} -> {:?} for workspace '{workspace_id}'",
                    job.step, step
                );
                return;
            }
            job.step = step;
            job.message = message.to_string();
            job.error = error;
            job.updated_at = Utc::now();

            if step == InitStep::Ready {
                self.schedule_ready_cleanup(workspace_id, job.attempt_id);
            }
            job.snapshot()
        };

        self.events
            .publish(CoordinatorEvent::InitProgress, &snapshot);
    }

    /// Drop the job record a while after it reaches `Ready`, unless a retry
    /// replaced it in the meantime (attempt id mismatch). This is internal
    /// cleanup, not `clear_job`: the cancellation set is left alone.
    ///
    /// Without a tokio runtime on the calling thread the record simply stays
    /// until `clear_job` or the next `start_job`.
    fn schedule_ready_cleanup(&self, workspace_id: &str, attempt_id: Uuid) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime, ready record for workspace '{workspace_id}' will not expire");
            return;
        };
        let jobs = Arc::clone(&self.jobs);
        let workspace_id = workspace_id.to_string();
        let ttl = self.ready_ttl;
        handle.spawn(async move {
            tokio::time::sleep(ttl).await;
            let remove = jobs
                .get(&workspace_id)
                .map(|job| job.attempt_id == attempt_id && job.step == InitStep::Ready)
                .unwrap_or(false);
            if remove {
                jobs.remove(&workspace_id);
                info!("Expired ready init job for workspace '{workspace_id}'");
            }
        });
    }

    pub fn mark_worktree_created(&self, workspace_id: &str) {
        if let Some(mut job) = self.jobs.get_mut(workspace_id) {
            job.worktree_created = true;
        }
    }

    pub fn was_worktree_created(&self, workspace_id: &str) -> bool {
        self.jobs
            .get(workspace_id)
            .map(|job| job.worktree_created)
            .unwrap_or(false)
    }

    /// Request cancellation. The durable set survives the job record; the
    /// in-memory flag is the fast path while the record still exists.
    pub fn cancel(&self, workspace_id: &str) {
        self.cancellations.insert(workspace_id.to_string());
        if let Some(mut job) = self.jobs.get_mut(workspace_id) {
            job.cancelled = true;
        }
        info!("Cancellation requested for workspace '{workspace_id}'");
    }

    /// The check long-running init work must poll between steps: it stays
    /// true even after the job record is gone, until `clear_job`.
    pub fn is_cancellation_requested(&self, workspace_id: &str) -> bool {
        self.cancellations.contains(workspace_id)
    }

    /// In-memory flag only. Prefer `is_cancellation_requested`: this returns
    /// false whenever the job record has already been dropped.
    pub fn is_cancelled(&self, workspace_id: &str) -> bool {
        self.jobs
            .get(workspace_id)
            .map(|job| job.cancelled)
            .unwrap_or(false)
    }

    pub fn is_initializing(&self, workspace_id: &str) -> bool {
        self.jobs
            .get(workspace_id)
            .map(|job| !job.step.is_terminal())
            .unwrap_or(false)
    }

    pub fn snapshot(&self, workspace_id: &str) -> Option<JobSnapshot> {
        self.jobs.get(workspace_id).map(|job| job.snapshot())
    }

    /// Remove job, done-signal, and cancellation flag. Called before a retry
    /// and after a successful delete.
    pub fn clear_job(&self, workspace_id: &str) {
        self.jobs.remove(workspace_id);
        self.done_signals.remove(workspace_id);
        self.cancellations.remove(workspace_id);
    }

    /// Resolve the done-signal. Idempotent. Deliberately does not clear the
    /// cancellation set: a cancellation issued during teardown must stay
    /// visible to code still polling it.
    ///
    /// Contract: every init attempt calls this exactly once on every exit
    /// path, or `wait_for_init` callers block until their timeout.
    pub fn finalize_job(&self, workspace_id: &str) {
        if let Some((_, tx)) = self.done_signals.remove(workspace_id) {
            let _ = tx.send(true);
        }
    }

    pub async fn wait_for_init(&self, workspace_id: &str) {
        self.wait_for_init_with_timeout(workspace_id, DEFAULT_WAIT_TIMEOUT)
            .await;
    }

    /// Wait for the done-signal or the timeout, whichever fires first. A
    /// timeout is swallowed: callers cannot distinguish it from completion
    /// and must poll `snapshot` when they need to.
    pub async fn wait_for_init_with_timeout(&self, workspace_id: &str, timeout: Duration) {
        let mut rx = match self.done_signals.get(workspace_id) {
            Some(tx) => tx.subscribe(),
            None => return,
        };

        let wait = async {
            loop {
                if *rx.borrow() {
                    return;
                }
                // Sender dropped means finalize or clear already happened.
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };

        if tokio::time::timeout(timeout, wait).await.is_err() {
            warn!("Timed out waiting for workspace '{workspace_id}' init");
        }
    }

    pub async fn acquire_project_lock(&self, project_id: &str) {
        self.locks.acquire(project_id).await;
    }

    pub async fn release_project_lock(&self, project_id: &str) {
        self.locks.release(project_id).await;
    }

    pub async fn has_project_lock(&self, project_id: &str) -> bool {
        self.locks.has_lock(project_id).await
    }
}
