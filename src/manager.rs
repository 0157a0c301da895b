use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::Sender;

use crate::config::ImportConfig;
use crate::containers::{Containers, MemoryContainers};
use crate::core::Kind;
use crate::engine::{Message, Scheduler, Shared};
use crate::error::ImportError;
use crate::future::ImportFuture;
use crate::registry::{Factory, Pipeline, Translator};
use crate::session::{ImportRequest, Session, SessionId};

/// The import context: owns the worker pool, the designated thread and every
/// registered capability.
///
/// Construct one at startup and pass it around; dropping it cancels every
/// session still running, waits for them to finish, and stops the threads.
///
/// ```rust
/// use yomikomi::{ImportConfig, ImportManager, ImportRequest, ImportStatus};
///
/// let manager = ImportManager::new(ImportConfig::default().with_workers(2)).unwrap();
/// let future = manager.submit(ImportRequest::new("/Game"));
///
/// future.wait_until_done();
/// assert_eq!(future.status(), ImportStatus::Done);
/// assert!(future.imported_objects().is_empty());
/// ```
pub struct ImportManager {
    shared: Arc<Shared>,
    sender: Sender<Message>,
    designated: ThreadId,
    handle: Option<JoinHandle<()>>,
    next_id: AtomicU64,
}

impl ImportManager {
    /// Starts a manager persisting into an in-memory container store.
    pub fn new(config: ImportConfig) -> Result<Self, ImportError> {
        Self::with_containers(config, Arc::new(MemoryContainers::new()))
    }

    pub fn with_containers(
        config: ImportConfig,
        containers: Arc<dyn Containers>,
    ) -> Result<Self, ImportError> {
        config.validate()?;

        let workers = config.worker_count();
        let budget = config.session_budget();
        let style = match config.progress {
            true => Some(crate::utils::style_session()?),
            false => None,
        };

        let prefix = config.worker_thread_prefix.clone();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(move |i| format!("{prefix}-{i}"))
            .build()?;

        let shared = Arc::new(Shared::new(containers));
        let (sender, receiver) = crossbeam_channel::unbounded();
        let scheduler = Scheduler::new(
            shared.clone(),
            pool,
            (sender.clone(), receiver),
            budget,
            style,
        );

        let handle = thread::Builder::new()
            .name(config.designated_thread_name.clone())
            .spawn(move || scheduler.run())?;

        tracing::debug!(workers, budget, "import manager started");

        Ok(Self {
            shared,
            sender,
            designated: handle.thread().id(),
            handle: Some(handle),
            next_id: AtomicU64::new(1),
        })
    }

    /// Registers the factory creating objects of `kind`. Returns `false`
    /// and keeps the existing one if the kind is already taken.
    pub fn register_factory(&self, kind: impl Into<Kind>, factory: Arc<dyn Factory>) -> bool {
        self.shared.registry.register_factory(kind.into(), factory)
    }

    /// Registers a pipeline, run by every request that does not bring its
    /// own. Pipelines are identified by name.
    pub fn register_pipeline(&self, pipeline: Arc<dyn Pipeline>) -> bool {
        self.shared.registry.register_pipeline(pipeline)
    }

    /// Registers a translator, identified by name. The first registered
    /// translator accepting a source translates it.
    pub fn register_translator(&self, translator: Arc<dyn Translator>) -> bool {
        self.shared.registry.register_translator(translator)
    }

    /// Submits a request. The session starts right away when a slot is
    /// free, otherwise it waits in line behind the earlier submissions.
    pub fn submit(&self, request: ImportRequest) -> ImportFuture {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let session = Arc::new(Session::new(id, request, self.shared.registry.pipelines()));
        let future = session.future.clone();

        self.shared.admit(session.clone());
        if let Err(err) = self.sender.send(Message::Submit(session)) {
            tracing::error!(session = %id, "designated thread is gone, import abandoned");
            let Message::Submit(session) = err.into_inner() else {
                unreachable!()
            };
            self.shared.abandon(&session);
        }

        future
    }

    /// Cancels every session submitted so far, queued ones included. The
    /// futures still resolve, once each session has reverted its work.
    pub fn cancel_all(&self) {
        self.cancel_live();
    }

    fn cancel_live(&self) -> HashSet<SessionId> {
        let sessions = self.shared.live_sessions();
        for session in &sessions {
            session.cancel();
        }

        let _ = self.sender.send(Message::CancelAll);
        tracing::info!(sessions = sessions.len(), "cancelling all imports");

        sessions.iter().map(|session| session.id).collect()
    }

    /// Like [`cancel_all`](Self::cancel_all), then blocks until every
    /// cancelled session is done.
    ///
    /// # Panics
    ///
    /// When called from the designated thread (e.g. from a completion
    /// callback), which is the thread that has to do the finalizing.
    pub fn cancel_all_synchronously(&self) {
        assert_ne!(
            thread::current().id(),
            self.designated,
            "cancel_all_synchronously called on the designated thread"
        );

        let ids = self.cancel_live();
        self.shared.wait_released(&ids);
    }

    /// Sessions admitted and not yet finalized.
    pub fn active_sessions(&self) -> usize {
        self.shared.active()
    }

    /// Sessions waiting for a free slot.
    pub fn queued_sessions(&self) -> usize {
        self.shared.queued()
    }

    /// Whether every submitted session is done.
    pub fn is_idle(&self) -> bool {
        self.shared.is_idle()
    }
}

impl Drop for ImportManager {
    fn drop(&mut self) {
        if thread::current().id() == self.designated {
            // Dropped from a callback; the loop winds down by itself once the
            // cancelled sessions are finalized.
            self.cancel_all();
            let _ = self.sender.send(Message::Shutdown);
            return;
        }

        self.cancel_all_synchronously();
        let _ = self.sender.send(Message::Shutdown);

        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("designated thread panicked");
        }
    }
}
