//! Background runner for cooperative composite tasks.
//!
//! The runner owns a single tokio task. Each pass it calls
//! [`CompositeTask::iterate`] on every task that reports pending work; when no
//! task asks for another iteration it parks until [`CompositeTaskRunner::wakeup`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{debug, trace};

/// A unit of background work driven by a [`CompositeTaskRunner`].
#[async_trait]
pub trait CompositeTask: Send + Sync {
    /// Whether the task has work to do.
    fn is_pending(&self) -> bool;

    /// Run one step; returns true if the task needs another iteration.
    async fn iterate(&self) -> bool;
}

struct RunnerShared {
    name: String,
    tasks: Mutex<Vec<Arc<dyn CompositeTask>>>,
    wakeup: Notify,
    shutdown: AtomicBool,
}

impl RunnerShared {
    async fn run(self: Arc<Self>) {
        debug!("Task runner {} started", self.name);
        loop {
            let shutting_down = self.shutdown.load(Ordering::SeqCst);
            let more_work = self.iterate_pending().await;

            if shutting_down {
                break;
            }
            if !more_work {
                self.wakeup.notified().await;
            }
        }
        debug!("Task runner {} stopped", self.name);
    }

    async fn iterate_pending(&self) -> bool {
        let tasks = self.tasks.lock().clone();
        let mut more_work = false;
        for task in tasks {
            if task.is_pending() {
                trace!("Task runner {} iterating", self.name);
                more_work |= task.iterate().await;
            }
        }
        more_work
    }
}

/// Drives registered [`CompositeTask`]s on one background tokio task.
pub struct CompositeTaskRunner {
    shared: Arc<RunnerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CompositeTaskRunner {
    /// Create a runner; nothing runs until [`CompositeTaskRunner::start`].
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(RunnerShared {
                name: name.into(),
                tasks: Mutex::new(Vec::new()),
                wakeup: Notify::new(),
                shutdown: AtomicBool::new(false),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Register a task. Tasks are iterated in registration order.
    pub fn add_task(&self, task: Arc<dyn CompositeTask>) {
        self.shared.tasks.lock().push(task);
    }

    /// Spawn the background task. Calling it again has no effect.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_none() && !self.shared.shutdown.load(Ordering::SeqCst) {
            *handle = Some(tokio::spawn(Arc::clone(&self.shared).run()));
        }
    }

    /// Ask the runner to check its tasks. Wakeups are not lost if the runner is busy.
    pub fn wakeup(&self) {
        self.shared.wakeup.notify_one();
    }

    /// Stop the runner after one final pass over pending tasks.
    ///
    /// Safe to call from inside a task iteration.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.wakeup.notify_one();
    }

    /// Wait for the background task to finish after [`CompositeTaskRunner::shutdown`].
    ///
    /// Must not be awaited from inside a task iteration.
    pub async fn join(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            // A panicking task has nothing left to clean up.
            let _ = handle.await;
        }
    }

    /// Whether the background task is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().is_some_and(|handle| !handle.is_finished())
    }
}

impl std::fmt::Debug for CompositeTaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeTaskRunner")
            .field("name", &self.shared.name)
            .field("tasks", &self.shared.tasks.lock().len())
            .field("running", &self.is_running())
            .finish()
    }
}
