//! ---
//! actrl_section: "02-lifecycle"
//! actrl_subsection: "module"
//! actrl_type: "source"
//! actrl_scope: "code"
//! actrl_description: "Single-consumer queue running callbacks in submission order."
//! actrl_version: "v0.0.0-prealpha"
//! actrl_owner: "tbd"
//! ---
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{LifecycleError, Result};

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Default)]
struct Progress {
    completed: u64,
    terminated: bool,
}

#[derive(Debug, Default)]
struct Shared {
    accepting: AtomicBool,
    stopping: AtomicBool,
    progress: Mutex<Progress>,
    done: Condvar,
}

/// Runs submitted tasks one at a time, in submission order, on a dedicated thread.
///
/// The queue is unbounded. [`EventSerializer::shutdown`] lets the running task
/// finish and discards everything still queued.
pub struct EventSerializer {
    name: String,
    sender: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    submitted: AtomicU64,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl std::fmt::Debug for EventSerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSerializer")
            .field("name", &self.name)
            .field("pending", &self.pending())
            .finish()
    }
}

impl EventSerializer {
    /// Spawn the worker thread and start accepting tasks.
    pub fn start(name: impl Into<String>) -> std::io::Result<Self> {
        let name = name.into();
        let (sender, receiver) = mpsc::unbounded_channel::<Task>();
        let shared = Arc::new(Shared {
            accepting: AtomicBool::new(true),
            ..Shared::default()
        });
        let worker_shared = shared.clone();
        let worker_name = name.clone();
        let worker = thread::Builder::new()
            .name(name.clone())
            .spawn(move || run_worker(worker_name, receiver, worker_shared))?;
        let worker_id = worker.thread().id();
        info!(serializer = %name, "event serializer started");
        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            submitted: AtomicU64::new(0),
            shared,
            worker: Mutex::new(Some(worker)),
            worker_id,
        })
    }

    /// Queue `task` behind everything submitted so far.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.shared.accepting.load(Ordering::Acquire) {
            return Err(LifecycleError::SerializerClosed);
        }
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(LifecycleError::SerializerClosed);
        };
        sender
            .send(Box::new(task))
            .map_err(|_| LifecycleError::SerializerClosed)?;
        self.submitted.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Whether the calling thread is the worker.
    pub fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    /// Whether new tasks are accepted.
    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::Acquire)
    }

    /// Tasks submitted but not yet finished.
    pub fn pending(&self) -> u64 {
        let submitted = self.submitted.load(Ordering::Acquire);
        submitted.saturating_sub(self.shared.progress.lock().completed)
    }

    /// Wait until every task submitted before this call has run.
    ///
    /// Returns `false` on timeout, when the worker stopped first, or when
    /// called from the worker itself.
    pub fn flush(&self, timeout: Duration) -> bool {
        if self.is_worker_thread() {
            warn!(serializer = %self.name, "flush requested from the worker thread");
            return false;
        }
        let target = {
            let _sender = self.sender.lock();
            self.submitted.load(Ordering::Acquire)
        };
        let deadline = Instant::now() + timeout;
        let mut progress = self.shared.progress.lock();
        while progress.completed < target {
            if progress.terminated {
                return false;
            }
            if self
                .shared
                .done
                .wait_until(&mut progress, deadline)
                .timed_out()
            {
                return progress.completed >= target;
            }
        }
        true
    }

    /// Stop accepting tasks, let the running task finish and discard the rest.
    pub fn shutdown(&self) {
        self.shared.accepting.store(false, Ordering::Release);
        self.shared.stopping.store(true, Ordering::Release);
        self.sender.lock().take();
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        if self.is_worker_thread() {
            debug!(serializer = %self.name, "shutdown requested from the worker; not joining");
            return;
        }
        if worker.join().is_err() {
            error!(serializer = %self.name, "event serializer worker panicked");
        }
        info!(serializer = %self.name, "event serializer stopped");
    }
}

fn run_worker(name: String, mut receiver: mpsc::UnboundedReceiver<Task>, shared: Arc<Shared>) {
    while let Some(task) = receiver.blocking_recv() {
        if shared.stopping.load(Ordering::Acquire) {
            break;
        }
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
            error!(serializer = %name, panic = %panic_message(payload.as_ref()), "serialized task panicked");
        }
        shared.progress.lock().completed += 1;
        shared.done.notify_all();
    }

    receiver.close();
    let mut discarded = 0usize;
    while receiver.try_recv().is_ok() {
        discarded += 1;
    }
    shared.progress.lock().terminated = true;
    shared.done.notify_all();
    debug!(serializer = %name, discarded, "event serializer worker exiting");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
