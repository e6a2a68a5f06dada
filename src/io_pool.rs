//! A fixed pool of reactor threads for socket-affinitized work.
//!
//! Each worker is one OS thread running a current-thread tokio runtime. An
//! accepted socket is handed to the next worker round-robin and stays on that
//! worker's loop for its whole lifetime, so all of a session's reads, writes
//! and state live on one thread.

use crate::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Fixed-size pool of single-threaded reactor runtimes.
#[derive(Debug)]
pub struct IoPool {
    workers: Vec<Worker>,
    /// Cursor for round-robin selection. Wraps modulo the pool size.
    next: AtomicUsize,
}

#[derive(Debug)]
struct Worker {
    handle: Handle,
    /// Idle sentinel: the worker's root task waits on this token, keeping the
    /// loop alive while no sockets are assigned to it.
    sentinel: CancellationToken,
    thread: Option<JoinHandle<()>>,
}

impl IoPool {
    /// Create `size` worker loops, one OS thread each.
    pub fn new(size: usize) -> Result<IoPool> {
        assert!(size > 0, "io pool needs at least one worker");

        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            let handle = runtime.handle().clone();
            let sentinel = CancellationToken::new();
            let keep_alive = sentinel.clone();
            let thread = std::thread::Builder::new()
                .name(format!("confab-io-{i}"))
                .spawn(move || {
                    runtime.block_on(keep_alive.cancelled());
                    debug!(worker = i, "io worker stopped");
                })?;
            workers.push(Worker {
                handle,
                sentinel,
                thread: Some(thread),
            });
        }

        Ok(IoPool {
            workers,
            next: AtomicUsize::new(0),
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// The next worker's runtime handle, selected round-robin.
    ///
    /// Lock-free: one atomic increment, taken modulo the pool size.
    pub fn handle(&self) -> &Handle {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        &self.workers[i].handle
    }

    /// Stop every worker loop and join the threads in order.
    ///
    /// Consuming `self` makes a post-shutdown `handle()` call impossible.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        for worker in &self.workers {
            worker.sentinel.cancel();
        }
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for IoPool {
    fn drop(&mut self) {
        self.stop();
    }
}
