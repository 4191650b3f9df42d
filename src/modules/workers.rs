//! Worker threads for backends that accept concurrent requests.
//!
//! `fuser` reads requests on a single session thread. For a backend
//! reporting [`Dispatch::MultiThreaded`](super::backend::Dispatch) the
//! dispatcher hands the data path (read, write, flush, fsync, release)
//! to this pool together with the reply, so slow I/O on one file does not
//! hold up requests for others.

use super::constants::{MIN_WORKERS, PROGRAM_NAME};
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::mpsc::{self, SendError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Number of workers for a multi-threaded mount.
pub fn worker_count() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(MIN_WORKERS)
}

/// A fixed set of threads draining one job queue.
pub struct WorkerPool {
    queue: Option<Sender<Job>>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `size` workers, at least one.
    pub fn new(size: usize) -> std::io::Result<Self> {
        let (queue, jobs) = mpsc::channel::<Job>();
        let jobs = Arc::new(Mutex::new(jobs));

        let mut threads = Vec::with_capacity(size.max(1));
        for index in 0..size.max(1) {
            let jobs = Arc::clone(&jobs);
            let thread = thread::Builder::new()
                .name(format!("{}-worker-{}", PROGRAM_NAME, index))
                .spawn(move || loop {
                    let next = jobs.lock().recv();
                    match next {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })?;
            threads.push(thread);
        }
        debug!("started {} worker threads", threads.len());

        Ok(Self {
            queue: Some(queue),
            threads,
        })
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.threads.len()
    }

    /// Queues `job` for the next free worker.
    ///
    /// Once every worker is gone the job runs on the calling thread.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        let job: Job = Box::new(job);
        let Some(queue) = &self.queue else {
            return job();
        };
        if let Err(SendError(job)) = queue.send(job) {
            warn!("worker threads are gone, running request inline");
            job();
        }
    }
}

impl Drop for WorkerPool {
    /// Lets queued jobs finish, then joins every worker.
    fn drop(&mut self) {
        drop(self.queue.take());
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                warn!("worker thread panicked");
            }
        }
    }
}
