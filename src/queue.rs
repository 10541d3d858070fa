use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Notify, oneshot};

use crate::job::{Job, JobResult};

/// A queued job together with the channel its result goes back on
#[derive(Debug)]
pub struct JobMessage {
    pub job: Job,
    pub responder: oneshot::Sender<JobResult>,
}

/// FIFO of pending jobs shared by the submitters and the worker pool
#[derive(Debug, Default)]
pub struct JobQueue {
    queue: Mutex<VecDeque<JobMessage>>,
    notify: Notify,
    running: AtomicUsize,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: JobMessage) {
        self.queue.lock().push_back(message);
        self.notify.notify_one();
    }

    /// Waits for the oldest pending job
    pub async fn pop(&self) -> JobMessage {
        loop {
            let next = self.queue.lock().pop_front();
            if let Some(message) = next {
                return message;
            }
            self.notify.notified().await;
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Number of jobs currently held by a worker
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Marks a job as running until the returned guard is dropped
    pub fn start_job(&self) -> RunningGuard<'_> {
        self.running.fetch_add(1, Ordering::SeqCst);
        RunningGuard { queue: self }
    }

    /// Drops every pending job; their workspaces are removed on drop and
    /// their submitters see a closed channel
    pub fn clear(&self) -> usize {
        let drained: Vec<JobMessage> = self.queue.lock().drain(..).collect();
        drained.len()
    }
}

pub struct RunningGuard<'a> {
    queue: &'a JobQueue,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.queue.running.fetch_sub(1, Ordering::SeqCst);
    }
}
