//! The worker pool and its job queue.
//!
//! Two job kinds: upload-level operations and per-entry processing. Entry
//! jobs from one upload run in parallel across workers; upload-level work is
//! serialized per upload by the state machine. Durability comes from the
//! state store: PENDING entries can be re-enqueued by a supervisor if a
//! worker dies with the in-memory queue.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use quarry_protocol::{EntryId, RawPath, UploadId};
use tracing::{debug, error};

use crate::context::ProcessingContext;

/// A pending file operation executed before matching and parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOperation {
    Add {
        path: PathBuf,
        target_dir: RawPath,
        /// Delete the source and its scratch directory when done.
        temporary: bool,
    },
    Delete {
        path: RawPath,
    },
}

#[derive(Debug, Clone)]
pub enum Job {
    ProcessUpload {
        upload_id: UploadId,
        file_operation: Option<FileOperation>,
    },
    ProcessEntry {
        upload_id: UploadId,
        entry_id: EntryId,
    },
}

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<Job>,
    /// Jobs currently executing on a worker.
    active: usize,
    shutdown: bool,
}

/// Cloneable handle onto the shared job queue.
#[derive(Clone, Default)]
pub struct JobQueue {
    inner: Arc<(Mutex<QueueState>, Condvar)>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, job: Job) {
        let (lock, condvar) = &*self.inner;
        let mut state = lock.lock().expect("job queue lock poisoned");
        state.jobs.push_back(job);
        condvar.notify_one();
    }

    /// Block until a job is available or the queue shuts down.
    fn pop_blocking(&self) -> Option<Job> {
        let (lock, condvar) = &*self.inner;
        let mut state = lock.lock().expect("job queue lock poisoned");
        loop {
            if let Some(job) = state.jobs.pop_front() {
                state.active += 1;
                return Some(job);
            }
            if state.shutdown {
                return None;
            }
            state = condvar
                .wait_timeout(state, Duration::from_millis(100))
                .expect("job queue lock poisoned")
                .0;
        }
    }

    fn job_done(&self) {
        let (lock, condvar) = &*self.inner;
        let mut state = lock.lock().expect("job queue lock poisoned");
        state.active -= 1;
        condvar.notify_all();
    }

    pub fn shutdown(&self) {
        let (lock, condvar) = &*self.inner;
        let mut state = lock.lock().expect("job queue lock poisoned");
        state.shutdown = true;
        condvar.notify_all();
    }

    /// True when no job is queued or running.
    pub fn is_idle(&self) -> bool {
        let (lock, _) = &*self.inner;
        let state = lock.lock().expect("job queue lock poisoned");
        state.jobs.is_empty() && state.active == 0
    }
}

/// Fixed pool of worker threads consuming the job queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    queue: JobQueue,
}

impl WorkerPool {
    pub fn start(ctx: Arc<ProcessingContext>, workers: usize) -> Self {
        let queue = ctx.queue.clone();
        let handles = (0..workers.max(1))
            .map(|index| {
                let ctx = ctx.clone();
                std::thread::Builder::new()
                    .name(format!("quarry-worker-{index}"))
                    .spawn(move || worker_loop(ctx))
                    .expect("could not spawn worker thread")
            })
            .collect();
        Self { handles, queue }
    }

    /// Stop accepting jobs and join all workers.
    pub fn shutdown(self) {
        self.queue.shutdown();
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(ctx: Arc<ProcessingContext>) {
    while let Some(job) = ctx.queue.pop_blocking() {
        run_job(&ctx, job);
        ctx.queue.job_done();
    }
}

fn run_job(ctx: &Arc<ProcessingContext>, job: Job) {
    match job {
        Job::ProcessUpload {
            upload_id,
            file_operation,
        } => {
            debug!(upload_id = %upload_id, "running upload job");
            if let Err(err) = crate::upload::run_upload_job(ctx, &upload_id, file_operation) {
                error!(upload_id = %upload_id, error = %err, "upload job failed");
            }
        }
        Job::ProcessEntry {
            upload_id,
            entry_id,
        } => {
            if let Err(err) = crate::entry::run_entry_job(ctx, &upload_id, &entry_id) {
                error!(upload_id = %upload_id, entry_id = %entry_id, error = %err, "entry job failed");
            }
        }
    }
}

/// Re-enqueue PENDING entries of uploads stuck waiting for results, e.g.
/// after a worker died with the in-memory queue.
pub fn resurrect_pending(ctx: &Arc<ProcessingContext>) -> quarry_protocol::Result<usize> {
    use quarry_protocol::ProcessStatus;
    use quarry_state::UploadQuery;

    let mut resurrected = 0;
    let mut page_after = None;
    loop {
        let page = ctx.store.list_uploads(&UploadQuery {
            process_status: Some(ProcessStatus::WaitingForResult),
            page_after: page_after.clone(),
            page_size: 100,
            ..UploadQuery::default()
        })?;
        for upload in &page.uploads {
            for entry_id in ctx.store.pending_entries(&upload.upload_id)? {
                ctx.queue.push(Job::ProcessEntry {
                    upload_id: upload.upload_id.clone(),
                    entry_id,
                });
                resurrected += 1;
            }
        }
        match page.next_page_after {
            Some(key) => page_after = Some(key),
            None => break,
        }
    }
    Ok(resurrected)
}
