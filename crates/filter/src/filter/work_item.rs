//! Per-filter work context
//!
//! Bus-relations post-processing has to leave the completion path it was
//! signalled from. Each filter owns one named thread that waits on an
//! `async_channel` and runs the filter's callback once per signal.

use async_channel::{Receiver, Sender, bounded};
use common::{Error, Result};
use std::thread::JoinHandle;
use tracing::{debug, error};

/// One signal per pending request is all a filter ever needs
const WORK_QUEUE_DEPTH: usize = 1;

/// Cloneable handle used to signal the work context
#[derive(Debug, Clone)]
pub struct WorkQueue {
    tx: Sender<()>,
}

impl WorkQueue {
    /// Signal the work context without blocking
    pub fn enqueue(&self) -> Result<()> {
        self.tx
            .try_send(())
            .map_err(|e| Error::Channel(e.to_string()))
    }
}

/// Dedicated worker thread
pub struct WorkItem {
    queue: WorkQueue,
    thread: Option<JoinHandle<()>>,
}

impl WorkItem {
    /// Spawn the worker thread
    pub fn spawn<F>(name: String, callback: F) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let (tx, rx) = bounded(WORK_QUEUE_DEPTH);
        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(move || run(rx, callback))?;

        Ok(Self {
            queue: WorkQueue { tx },
            thread: Some(thread),
        })
    }

    pub fn queue(&self) -> WorkQueue {
        self.queue.clone()
    }

    /// Stop accepting signals and wait for the thread to exit
    ///
    /// Signals already queued are still processed.
    pub fn shutdown(&mut self) {
        self.queue.tx.close();

        let Some(thread) = self.thread.take() else {
            return;
        };
        // Dropping the owner from its own callback must not self-join
        if thread.thread().id() == std::thread::current().id() {
            return;
        }
        if thread.join().is_err() {
            error!("Work item thread panicked");
        }
    }
}

impl Drop for WorkItem {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<F: Fn()>(rx: Receiver<()>, callback: F) {
    debug!("Work item started");

    while rx.recv_blocking().is_ok() {
        // Keep the thread alive across a failing callback
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(&callback));
        if let Err(e) = result {
            error!("Panic in work item callback: {:?}", e);
        }
    }

    debug!("Work item stopped");
}
