//! # Close Worker
//!
//! Asynchronous reclamation of kernel buffer handles. Closing a handle is a
//! kernel round-trip; the active worker keeps that cost off the submission
//! path.
//!
//! Modes are fixed at construction:
//! - `Active`: a persistent background thread owns the close queue.
//! - `Inactive`: closes happen synchronously on the calling thread, for
//!   contexts where background concurrency is undesirable (secondary or
//!   internal engine contexts).
//!
//! Shutdown drains every queued close before the worker is dropped; pending
//! closes are never silently discarded.

use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use basalt_core::{BoHandle, ReclaimMode};
use basalt_uapi::IoctlAdapter;

// =============================================================================
// CLOSE WORKER
// =============================================================================

/// Reclamation worker for one device.
pub struct CloseWorker {
    mode: ReclaimMode,
    adapter: Arc<IoctlAdapter>,
    tx: Option<Sender<BoHandle>>,
    thread: Option<JoinHandle<()>>,
}

impl CloseWorker {
    /// Create a worker in the given mode
    pub fn new(adapter: Arc<IoctlAdapter>, mode: ReclaimMode) -> Self {
        let (tx, thread) = match mode {
            ReclaimMode::Active => {
                let (tx, rx) = mpsc::channel::<BoHandle>();
                let worker_adapter = Arc::clone(&adapter);
                let thread = std::thread::Builder::new()
                    .name("bo-close".into())
                    .spawn(move || {
                        // recv keeps yielding queued handles after the sender
                        // drops, so shutdown drains the backlog here.
                        while let Ok(handle) = rx.recv() {
                            close_one(&worker_adapter, handle);
                        }
                    })
                    .expect("failed to spawn close worker");
                (Some(tx), Some(thread))
            }
            ReclaimMode::Inactive => (None, None),
        };
        Self {
            mode,
            adapter,
            tx,
            thread,
        }
    }

    /// The mode fixed at construction
    #[inline]
    pub fn mode(&self) -> ReclaimMode {
        self.mode
    }

    /// Queue a handle for closing.
    ///
    /// Inactive mode closes inline on the calling thread.
    pub fn push(&self, handle: BoHandle) {
        match &self.tx {
            Some(tx) => {
                if tx.send(handle).is_err() {
                    // Worker already gone; close on the caller rather than
                    // leak the handle.
                    close_one(&self.adapter, handle);
                }
            }
            None => close_one(&self.adapter, handle),
        }
    }
}

impl Drop for CloseWorker {
    fn drop(&mut self) {
        // Dropping the sender ends the worker loop once the queue is empty.
        drop(self.tx.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("close worker thread panicked during shutdown");
            }
        }
    }
}

fn close_one(adapter: &IoctlAdapter, handle: BoHandle) {
    if let Err(e) = adapter.destroy_buffer(handle) {
        // The handle is unrecoverable either way; record and move on.
        log::warn!("failed to close {handle}: {e}");
    }
}
