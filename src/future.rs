use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::core::{Kind, Object};
use crate::engine::{TaskRecord, Timeline};
use crate::error::Diagnostic;
use crate::utils::panic_message;

/// Lifecycle of an [`ImportFuture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImportStatus {
    /// Submitted, still waiting in the admission queue.
    Uninitialized,
    /// Admitted, tasks are running.
    InProgress,
    /// Every task of the session has run, including finalization.
    Done,
}

const UNINITIALIZED: u8 = 0;
const IN_PROGRESS: u8 = 1;
const DONE: u8 = 2;

type Callback = Box<dyn FnOnce(&ImportFuture) + Send>;

enum Completion {
    Pending(Vec<Callback>),
    Fired,
}

struct Shared {
    status: AtomicU8,
    cancelled: AtomicBool,
    objects: RwLock<Vec<Object>>,
    diagnostics: RwLock<Vec<Diagnostic>>,
    timeline: RwLock<Vec<TaskRecord>>,
    completion: Mutex<Completion>,
    signal: Condvar,
}

/// The externally observable result of one import request.
///
/// Cheap to clone, every clone observes the same session. Objects are
/// appended as soon as they are fully populated, so the list can be polled
/// while the import is still running. It only ever grows.
#[derive(Clone)]
pub struct ImportFuture {
    shared: Arc<Shared>,
}

impl ImportFuture {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                status: AtomicU8::new(UNINITIALIZED),
                cancelled: AtomicBool::new(false),
                objects: RwLock::new(Vec::new()),
                diagnostics: RwLock::new(Vec::new()),
                timeline: RwLock::new(Vec::new()),
                completion: Mutex::new(Completion::Pending(Vec::new())),
                signal: Condvar::new(),
            }),
        }
    }

    pub fn status(&self) -> ImportStatus {
        match self.shared.status.load(Ordering::Acquire) {
            UNINITIALIZED => ImportStatus::Uninitialized,
            IN_PROGRESS => ImportStatus::InProgress,
            _ => ImportStatus::Done,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status() == ImportStatus::Done
    }

    /// Whether the session was cancelled before it finished.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }

    /// Moves the future to `InProgress`. Safe to call any number of times,
    /// from any state.
    pub(crate) fn start(&self) -> bool {
        self.shared
            .status
            .compare_exchange(UNINITIALIZED, IN_PROGRESS, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Moves the future to `Done`, exactly once. Returns `false` if some
    /// other call already did.
    pub(crate) fn finish(&self) -> bool {
        self.start();

        if self
            .shared
            .status
            .compare_exchange(IN_PROGRESS, DONE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        // Callbacks run before waiters are released. Callbacks registered
        // while this loop runs are picked up by the next round.
        loop {
            let callbacks = {
                let mut completion = self.lock_completion();
                match &mut *completion {
                    Completion::Pending(callbacks) if !callbacks.is_empty() => {
                        std::mem::take(callbacks)
                    }
                    _ => {
                        *completion = Completion::Fired;
                        break;
                    }
                }
            };

            for callback in callbacks {
                // A failing callback must not keep the others or the
                // waiters from seeing the session done.
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(self))) {
                    let message = panic_message(panic.as_ref());
                    tracing::error!("completion callback panicked: {message}");
                    self.add_diagnostic(Diagnostic::TaskPanicked {
                        task: String::from("on-done callback"),
                        message,
                    });
                }
            }
        }

        self.shared.signal.notify_all();

        true
    }

    /// Blocks the calling thread until the session is done.
    pub fn wait_until_done(&self) {
        let mut completion = self.lock_completion();
        while matches!(*completion, Completion::Pending(_)) {
            completion = self
                .shared
                .signal
                .wait(completion)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`wait_until_done`](Self::wait_until_done) with an upper bound.
    /// Returns whether the session is done.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut completion = self.lock_completion();

        while matches!(*completion, Completion::Pending(_)) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            completion = self
                .shared
                .signal
                .wait_timeout(completion, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        true
    }

    /// Registers a callback for when the session is done. If it already is,
    /// the callback runs right away on the calling thread; otherwise it runs
    /// on the thread that finalizes the session.
    pub fn on_done<F>(&self, callback: F)
    where
        F: FnOnce(&ImportFuture) + Send + 'static,
    {
        {
            let mut completion = self.lock_completion();
            if let Completion::Pending(callbacks) = &mut *completion {
                callbacks.push(Box::new(callback));
                return;
            }
        }

        callback(self);
    }

    /// A snapshot of the objects imported so far.
    pub fn imported_objects(&self) -> Vec<Object> {
        self.shared
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The first imported object of the given kind.
    pub fn first_of_kind(&self, kind: impl Into<Kind>) -> Option<Object> {
        let kind = kind.into();
        self.shared
            .objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|object| *object.kind() == kind)
            .cloned()
    }

    /// Every non-fatal problem recorded so far.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.shared
            .diagnostics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The tasks executed for this session so far.
    pub fn timeline(&self) -> Timeline {
        let records = self
            .shared
            .timeline
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        Timeline::new(records)
    }

    pub(crate) fn add_object(&self, object: Object) {
        self.shared
            .objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(object);
    }

    pub(crate) fn add_diagnostic(&self, diagnostic: Diagnostic) {
        self.shared
            .diagnostics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(diagnostic);
    }

    pub(crate) fn record(&self, record: TaskRecord) {
        self.shared
            .timeline
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    pub(crate) fn mark_cancelled(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
    }

    fn lock_completion(&self) -> MutexGuard<'_, Completion> {
        self.shared
            .completion
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ImportFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportFuture")
            .field("status", &self.status())
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}
