use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::job::JobResult;
use crate::queue::{JobMessage, JobQueue};
use crate::sandbox::JobRunner;

/// Pulls jobs off the queue one at a time until `token` is cancelled
///
/// A pool of these bounds how many jobs run at once. A job that panics is
/// reported as an internal error; the worker keeps going.
pub async fn worker<R: JobRunner>(
    id: usize,
    runner: Arc<R>,
    queue: Arc<JobQueue>,
    token: CancellationToken,
) {
    log::info!("Worker {id} initialized");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("Worker {id} received shutdown signal, stopping");
                break;
            }

            message = queue.pop() => {
                let JobMessage { job, responder } = message;
                let job_id = job.id;
                let _running = queue.start_job();
                log::debug!("Worker {id} got job {job_id} from queue");

                // A separate task keeps a panicking job from taking the worker down
                let runner_ref = Arc::clone(&runner);
                let handle = tokio::spawn(async move { runner_ref.run(job).await });

                let result = match handle.await {
                    Ok(result) => result,
                    Err(e) => {
                        log::error!("Job {job_id} crashed on worker {id}: {e}");
                        JobResult::internal()
                    }
                };

                if responder.send(result).is_err() {
                    log::warn!("Submitter of job {job_id} went away before the result was ready");
                }
            }
        }
    }

    log::info!("Worker {id} has shut down gracefully");
}
