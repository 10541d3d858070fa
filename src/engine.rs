use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{EngineConfig, ToolchainConfig};
use crate::job::{Job, JobRequest, JobResult, RunRequest};
use crate::queue::{JobMessage, JobQueue};
use crate::sandbox::{JobRunner, Pipeline, ProcessRunner, Sandbox, SandboxPrefix};
use crate::worker::worker;
use crate::workspace::WorkspaceManager;

/// Entry point of the execution core: validates requests, gives each one a
/// workspace and waits for the worker pool to produce its result
#[derive(Debug)]
pub struct Engine {
    queue: Arc<JobQueue>,
    workspaces: Arc<WorkspaceManager>,
}

impl Engine {
    /// Builds the production engine and spawns its worker pool
    pub fn start(
        config: &EngineConfig,
        toolchains: ToolchainConfig,
        prefix: SandboxPrefix,
        token: CancellationToken,
    ) -> Result<(Self, JoinSet<()>)> {
        let workspaces = WorkspaceManager::new(config.workspace_root())?;
        let max_output_bytes =
            usize::try_from(config.max_output_bytes).context("Invalid max_output_bytes")?;
        let pipeline = Pipeline::new(
            ProcessRunner::new(max_output_bytes),
            prefix,
            toolchains,
            config.per_job_timeout_ms.into(),
        );
        let sandbox = Arc::new(Sandbox::new(pipeline));

        Ok(Self::with_runner(
            workspaces,
            sandbox,
            config.concurrency_limit,
            token,
        ))
    }

    /// Spawns `concurrency_limit` workers that hand jobs to `runner`
    pub fn with_runner<R: JobRunner>(
        workspaces: WorkspaceManager,
        runner: Arc<R>,
        concurrency_limit: usize,
        token: CancellationToken,
    ) -> (Self, JoinSet<()>) {
        let queue = Arc::new(JobQueue::new());

        let mut workers = JoinSet::new();
        for i in 1..=concurrency_limit {
            workers.spawn(worker(i, runner.clone(), queue.clone(), token.clone()));
        }

        let engine = Self {
            queue,
            workspaces: Arc::new(workspaces),
        };
        (engine, workers)
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Runs one request to completion. Never fails: every outcome, including
    /// rejection and internal trouble, is a [`JobResult`].
    pub async fn submit(&self, request: RunRequest) -> JobResult {
        let request = match JobRequest::try_from(request) {
            Ok(request) => request,
            Err(reason) => {
                log::info!("Rejected request: {reason}");
                return JobResult::Rejected { reason };
            }
        };

        let workspace = match self.workspaces.allocate() {
            Ok(workspace) => workspace,
            Err(e) => {
                log::error!("Failed to allocate a workspace: {e:#}");
                return JobResult::internal();
            }
        };

        let job = Job::new(request, workspace);
        let job_id = job.id;
        log::info!("Accepted job {job_id} ({})", job.request.language);

        let (tx, rx) = oneshot::channel();
        self.queue.push(JobMessage { job, responder: tx });

        match rx.await {
            Ok(result) => result,
            Err(e) => {
                log::error!("Job {job_id} was dropped before completing: {e}");
                JobResult::internal()
            }
        }
    }
}
