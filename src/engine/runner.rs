pub(crate) mod diagnostics;

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use indicatif::ProgressStyle;
use petgraph::graph::NodeIndex;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::containers::Containers;
use crate::engine::builder::{self, Layout};
use crate::engine::graph::TaskGraph;
use crate::engine::{Affinity, TaskDescriptor, TaskOutcome, tasks};
use crate::error::Diagnostic;
use crate::registry::Registry;
use crate::session::{Session, SessionId};
use crate::utils::panic_message;

use self::diagnostics::TaskRecord;

/// State shared between the public manager handle, the scheduler loop and
/// the tasks running on the pool.
pub(crate) struct Shared {
    pub registry: Registry,
    pub containers: Arc<dyn Containers>,
    /// Sessions submitted and not yet released, queued ones included.
    live: Mutex<HashMap<SessionId, Arc<Session>>>,
    released: Condvar,
    active: AtomicUsize,
    queued: AtomicUsize,
}

impl Shared {
    pub fn new(containers: Arc<dyn Containers>) -> Self {
        Self {
            registry: Registry::default(),
            containers,
            live: Mutex::new(HashMap::new()),
            released: Condvar::new(),
            active: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.lock_live().is_empty()
    }

    /// Registers a submitted session, before it is handed to the scheduler.
    pub fn admit(&self, session: Arc<Session>) {
        self.queued.fetch_add(1, Ordering::AcqRel);
        self.lock_live().insert(session.id, session);
    }

    pub fn live_sessions(&self) -> Vec<Arc<Session>> {
        let mut list: Vec<_> = self.lock_live().values().cloned().collect();
        list.sort_by_key(|session| session.id);
        list
    }

    /// Resolves a session the scheduler never got to see.
    pub fn abandon(&self, session: &Session) {
        self.queued.fetch_sub(1, Ordering::AcqRel);
        session.cancel();
        session.future.finish();
        self.release(session.id);
    }

    fn release(&self, id: SessionId) {
        let removed = self.lock_live().remove(&id);
        assert!(removed.is_some(), "session {id} released twice");
        self.released.notify_all();
    }

    /// Blocks until none of the given sessions is live anymore.
    pub fn wait_released(&self, ids: &HashSet<SessionId>) {
        let mut live = self.lock_live();
        while live.keys().any(|id| ids.contains(id)) {
            live = self
                .released
                .wait(live)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn lock_live(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<Session>>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Messages received by the scheduler loop.
pub(crate) enum Message {
    Submit(Arc<Session>),
    Completed {
        session: SessionId,
        index: NodeIndex,
        outcome: TaskOutcome,
        record: TaskRecord,
    },
    CancelAll,
    Shutdown,
}

struct Running {
    session: Arc<Session>,
    graph: TaskGraph,
    layout: Layout,
}

/// The scheduler loop, owned by the designated thread.
///
/// It admits sessions, keeps every running session's task graph, runs
/// designated-only tasks inline and sends everything else to the worker
/// pool. Workers report back through the inbox, so the graphs are only ever
/// touched from this one thread.
pub(crate) struct Scheduler {
    shared: Arc<Shared>,
    pool: rayon::ThreadPool,
    inbox: Receiver<Message>,
    outbox: Sender<Message>,
    budget: usize,
    style: Option<ProgressStyle>,
    running: HashMap<SessionId, Running>,
    queue: VecDeque<Arc<Session>>,
    local: VecDeque<(SessionId, NodeIndex)>,
    stopping: bool,
}

impl Scheduler {
    pub fn new(
        shared: Arc<Shared>,
        pool: rayon::ThreadPool,
        (outbox, inbox): (Sender<Message>, Receiver<Message>),
        budget: usize,
        style: Option<ProgressStyle>,
    ) -> Self {
        Self {
            shared,
            pool,
            inbox,
            outbox,
            budget,
            style,
            running: HashMap::new(),
            queue: VecDeque::new(),
            local: VecDeque::new(),
            stopping: false,
        }
    }

    pub fn run(mut self) {
        tracing::debug!(workers = self.pool.current_num_threads(), budget = self.budget, "scheduler started");

        loop {
            // Completions first, they are what unlocks more work.
            while let Ok(message) = self.inbox.try_recv() {
                self.handle(message);
            }

            if let Some((id, index)) = self.local.pop_front() {
                self.run_local(id, index);
                continue;
            }

            if self.stopping && self.running.is_empty() && self.queue.is_empty() {
                break;
            }

            match self.inbox.recv() {
                Ok(message) => self.handle(message),
                Err(_) => break,
            }
        }

        tracing::debug!("scheduler stopped");
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Submit(session) => {
                if session.is_cancelled() || self.running.len() < self.budget {
                    self.start(session);
                } else {
                    tracing::debug!(parent: &session.span, queued = self.queue.len() + 1, "session queued");
                    self.queue.push_back(session);
                }
            }
            Message::Completed {
                session,
                index,
                outcome,
                record,
            } => self.complete(session, index, outcome, record),
            Message::CancelAll => {
                // Cancelled sessions skip the queue, their tasks are no-ops
                // and they only need to run through finalization.
                let (cancelled, waiting) = self
                    .queue
                    .drain(..)
                    .partition::<VecDeque<_>, _>(|session| session.is_cancelled());
                self.queue = waiting;

                for session in cancelled {
                    self.start(session);
                }
            }
            Message::Shutdown => self.stopping = true,
        }
    }

    fn start(&mut self, session: Arc<Session>) {
        self.shared.queued.fetch_sub(1, Ordering::AcqRel);
        session.future.start();

        if let Some(style) = &self.style {
            session.span.pb_set_style(style);
            session.span.pb_set_message("importing");
        }
        session.span.in_scope(|| tracing::info!("import started"));

        let mut graph = TaskGraph::new();
        let layout = builder::build_pre_stage(&mut graph, &session, &self.shared.registry);

        let id = session.id;
        self.running.insert(
            id,
            Running {
                session,
                graph,
                layout,
            },
        );
        self.shared.active.store(self.running.len(), Ordering::Release);

        self.dispatch(id);
    }

    /// Hands every ready task of a session to its execution context.
    fn dispatch(&mut self, id: SessionId) {
        let Some(running) = self.running.get_mut(&id) else {
            return;
        };

        let ready = running.graph.take_ready();
        if self.style.is_some() {
            running.session.span.pb_set_length(running.graph.len() as u64);
        }

        for index in ready {
            let task = running.graph.task(index).clone();

            match (task.affinity)(running.session.as_ref()) {
                Affinity::Designated => self.local.push_back((id, index)),
                Affinity::AnyWorker => {
                    let session = running.session.clone();
                    let shared = self.shared.clone();
                    let outbox = self.outbox.clone();
                    let prerequisites = running.graph.prerequisites(index);

                    self.pool.spawn(move || {
                        let (outcome, record) =
                            execute(&task, &session, &shared, index, prerequisites, false);

                        // Only fails once the scheduler is gone, nobody is
                        // waiting for the result then.
                        let _ = outbox.send(Message::Completed {
                            session: session.id,
                            index,
                            outcome,
                            record,
                        });
                    });
                }
            }
        }
    }

    fn run_local(&mut self, id: SessionId, index: NodeIndex) {
        let Some(running) = self.running.get(&id) else {
            panic!("designated task queued for unknown session {id}");
        };

        let task = running.graph.task(index).clone();
        let session = running.session.clone();
        let prerequisites = running.graph.prerequisites(index);

        let (outcome, record) = execute(&task, &session, &self.shared, index, prerequisites, true);
        self.complete(id, index, outcome, record);
    }

    fn complete(&mut self, id: SessionId, index: NodeIndex, outcome: TaskOutcome, record: TaskRecord) {
        let Some(running) = self.running.get_mut(&id) else {
            panic!("task completed for unknown session {id}");
        };

        running.session.future.record(record);

        if let TaskOutcome::Plan(plan) = outcome {
            builder::wire_plan(&mut running.graph, &running.layout, plan, &running.session);
        }

        running.graph.complete(index);
        if self.style.is_some() {
            running.session.span.pb_inc(1);
        }

        if index == running.layout.finalize {
            self.release(id);
        } else {
            self.dispatch(id);
        }
    }

    /// Resolves the future of a finished session and gives its slot to the
    /// next queued one.
    fn release(&mut self, id: SessionId) {
        let Some(running) = self.running.remove(&id) else {
            panic!("session {id} released twice");
        };

        assert_eq!(
            running.graph.completed(),
            running.graph.len(),
            "session {id} finalized with tasks outstanding",
        );

        let finished = running.session.future.finish();
        assert!(finished, "future of session {id} resolved twice");

        self.shared.active.store(self.running.len(), Ordering::Release);
        self.shared.release(id);

        while self.running.len() < self.budget {
            let Some(next) = self.queue.pop_front() else {
                break;
            };
            self.start(next);
        }
    }
}

/// Runs one task body inside its tracing span, timing it and turning a
/// panic into a diagnostic.
fn execute(
    task: &TaskDescriptor,
    session: &Session,
    shared: &Shared,
    index: NodeIndex,
    prerequisites: Vec<usize>,
    designated: bool,
) -> (TaskOutcome, TaskRecord) {
    let span = tracing::debug_span!(parent: &session.span, "task", kind = task.kind.as_str(), label = %task.label);
    let _enter = span.enter();

    let start = Instant::now();

    let outcome = match catch_unwind(AssertUnwindSafe(|| tasks::run(task, session, shared))) {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic_message(panic.as_ref());

            tracing::error!("task panicked: {message}");
            session.future.add_diagnostic(Diagnostic::TaskPanicked {
                task: task.label.clone(),
                message,
            });
            TaskOutcome::Done
        }
    };

    let record = TaskRecord {
        index: index.index(),
        kind: task.kind,
        label: task.label.clone(),
        node: task.node().cloned(),
        source: task.source,
        start,
        duration: start.elapsed(),
        designated,
        skipped: matches!(outcome, TaskOutcome::Skipped),
        prerequisites,
    };

    (outcome, record)
}
