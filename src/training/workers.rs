//! Fixed-size worker pool fed by a bounded channel.
//!
//! Dropping the pool raises the shutdown flag and joins every worker; a job that is
//! already running finishes (or reaches its next cancellation checkpoint) first.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, RecvTimeoutError};
use tracing::{debug, error};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawn `size` workers named `<name>-<idx>`, each calling `handler(idx, message)`.
    pub fn spawn<M, F>(
        name: &str,
        size: usize,
        rx: Receiver<M>,
        shutdown: Arc<AtomicBool>,
        handler: Arc<F>,
    ) -> std::io::Result<Self>
    where
        M: Send + 'static,
        F: Fn(usize, M) + Send + Sync + 'static,
    {
        let mut handles = Vec::with_capacity(size);
        for idx in 0..size {
            let rx = rx.clone();
            let shutdown = shutdown.clone();
            let handler = handler.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-{idx}"))
                .spawn(move || {
                    debug!(worker = idx, "worker started");
                    while !shutdown.load(Ordering::Acquire) {
                        match rx.recv_timeout(POLL_INTERVAL) {
                            Ok(message) => handler(idx, message),
                            Err(RecvTimeoutError::Timeout) => continue,
                            Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                    debug!(worker = idx, "worker stopped");
                })?;
            handles.push(handle);
        }
        Ok(Self { handles, shutdown })
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked outside job supervision");
            }
        }
    }
}
