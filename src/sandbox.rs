mod language;
mod pipeline;
mod prefix;
mod process;
mod runner;

pub use language::Language;
pub use pipeline::{CommandLine, Pipeline, StagePlan};
pub use prefix::SandboxPrefix;
pub use process::{ProcessOutcome, ProcessRunner};
pub use runner::JobRunner;

use std::time::Instant;

use crate::job::{Job, JobResult};

/// The production [`JobRunner`]: runs the language pipeline, then removes
/// the workspace no matter how the pipeline ended
#[derive(Debug)]
pub struct Sandbox {
    pipeline: Pipeline,
}

impl Sandbox {
    pub fn new(pipeline: Pipeline) -> Self {
        Self { pipeline }
    }
}

impl JobRunner for Sandbox {
    async fn run(&self, job: Job) -> JobResult {
        let Job {
            id,
            request,
            workspace,
        } = job;
        let started = Instant::now();

        let result = match self.pipeline.execute(&request, workspace.path()).await {
            Ok(result) => result,
            Err(e) => {
                log::error!("Job {id} failed internally: {e:#}");
                JobResult::internal()
            }
        };

        workspace.release().await;
        log::info!(
            "Job {id} ({}) finished as {} in {:?}",
            request.language,
            result.kind(),
            started.elapsed()
        );

        result
    }
}
