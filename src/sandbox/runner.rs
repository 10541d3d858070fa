use std::future::Future;

use crate::job::{Job, JobResult};

/// Something the worker pool can hand a job to
///
/// Implementations own the job from here on: they must turn every failure
/// into a [`JobResult`] and release the job's workspace before returning.
pub trait JobRunner: Send + Sync + 'static {
    fn run(&self, job: Job) -> impl Future<Output = JobResult> + Send;
}
