//! Named FIFO worker threads
//!
//! A [`Worker`] owns one thread draining a crossbeam channel in order. The
//! start-level queue, the refresh queue and the event dispatcher each run
//! on one.

use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{bounded, unbounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use graft_core::error::{GraftError, GraftResult};

pub(crate) struct Worker<R: Send + 'static> {
    name: String,
    sender: Mutex<Option<Sender<R>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl<R: Send + 'static> Worker<R> {
    /// Spawn a worker calling `handler` for every request, in order.
    ///
    /// `capacity` bounds the queue; submitters block while it is full.
    pub(crate) fn spawn<F>(name: &str, capacity: Option<usize>, mut handler: F) -> GraftResult<Self>
    where
        F: FnMut(R) + Send + 'static,
    {
        let (sender, receiver) = match capacity {
            Some(capacity) => bounded(capacity),
            None => unbounded(),
        };

        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(request) = receiver.recv() {
                    handler(request);
                }
                debug!("Worker {} exited", thread_name);
            })
            .map_err(|e| GraftError::io(format!("Failed to spawn worker {}", name), e))?;

        Ok(Self {
            name: name.to_string(),
            thread_id: handle.thread().id(),
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Queue a request; false once the worker has been stopped
    pub(crate) fn submit(&self, request: R) -> bool {
        let sender = match self.sender.lock().as_ref() {
            Some(sender) => sender.clone(),
            None => return false,
        };
        sender.send(request).is_ok()
    }

    /// Check if the caller runs on this worker's thread
    pub(crate) fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Close the queue and wait for the queued requests to drain.
    ///
    /// Called from the worker's own thread this only closes the queue.
    pub(crate) fn stop(&self) {
        self.sender.lock().take();
        if self.is_current() {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                warn!("Worker {} panicked", self.name);
            }
        }
    }
}
