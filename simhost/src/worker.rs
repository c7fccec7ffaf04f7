//! Fixed worker pool for frame-synced and asynchronous module execution.
//!
//! Jobs arrive over a shared channel; completions flow back to the scheduler
//! thread stamped with the module's dispatch epoch, so a completion from an
//! abandoned (timed-out) run is recognizable and discarded.

use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{HostError, Result};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Outcome of one worker-side module run.
pub(crate) struct Completion {
    pub module_index: usize,
    pub epoch: u64,
    pub outcome: std::result::Result<(), String>,
    pub duration: Duration,
}

pub(crate) struct WorkerPool {
    job_tx: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Result<Self> {
        let (job_tx, job_rx) = std::sync::mpsc::channel::<Job>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let mut handles = Vec::with_capacity(threads.max(1));
        for index in 0..threads.max(1) {
            let rx = job_rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("simhost-worker-{index}"))
                .spawn(move || worker_loop(rx))
                .map_err(|err| HostError::InvalidState(format!("worker spawn failed: {err}")))?;
            handles.push(handle);
        }
        Ok(Self {
            job_tx: Some(job_tx),
            handles,
        })
    }

    pub fn execute(&self, job: Job) -> Result<()> {
        self.job_tx
            .as_ref()
            .ok_or(HostError::ChannelClosed)?
            .send(job)
            .map_err(|_| HostError::ChannelClosed)
    }
}

fn worker_loop(rx: Arc<Mutex<Receiver<Job>>>) {
    loop {
        // Take the next job while holding the lock, run it without.
        let job = {
            let guard = rx.lock();
            guard.recv()
        };
        match job {
            Ok(job) => job(),
            Err(_) => break,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel lets idle workers drain out.
        self.job_tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
