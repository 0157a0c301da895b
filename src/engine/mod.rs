//! The task graph machinery.
//!
//! Every import session is turned into a graph of [`TaskDescriptor`]s linked
//! by prerequisite edges. The graph is built in two layers:
//!
//! 1. At admission, the pre-stage layer: one `Translate` task per source, a
//!    strictly sequential chain of `PrePipeline` tasks, a `Parse` task, and
//!    the `PreFinalize` and `Finalize` pair closing the session.
//! 2. When `Parse` completes, the creation layer: per importable node a
//!    `BuildContainer` → `CreatePlaceholder` → `Populate` → `PostPipeline`*
//!    chain, gated on the chains of the nodes it depends on, all feeding
//!    into `PreFinalize`.
//!
//! The scheduler in [`runner`] owns every session graph and mutates it from
//! a single thread, the designated thread.
mod builder;
mod graph;
mod runner;
mod sort;
mod tasks;

use std::sync::Arc;

use serde::Serialize;

use crate::core::{Kind, NodeId};
use crate::registry::{Factory, Pipeline, Translator};
use crate::session::{ObjectKey, Session};

pub use crate::engine::runner::diagnostics::{TaskRecord, Timeline};
pub(crate) use crate::engine::runner::{Message, Scheduler, Shared};

/// What a task does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    Translate,
    PrePipeline,
    Parse,
    BuildContainer,
    CreatePlaceholder,
    Populate,
    PostPipeline,
    PreFinalize,
    Finalize,
}

impl TaskKind {
    /// Whether the task turns into a no-op once its session is cancelled.
    /// The closing pair always runs, it is what reverts a cancelled session.
    pub fn observes_cancellation(self) -> bool {
        !matches!(self, TaskKind::PreFinalize | TaskKind::Finalize)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Translate => "translate",
            TaskKind::PrePipeline => "pre-pipeline",
            TaskKind::Parse => "parse",
            TaskKind::BuildContainer => "build-container",
            TaskKind::CreatePlaceholder => "create-placeholder",
            TaskKind::Populate => "populate",
            TaskKind::PostPipeline => "post-pipeline",
            TaskKind::PreFinalize => "pre-finalize",
            TaskKind::Finalize => "finalize",
        }
    }
}

/// Where a task is allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Affinity {
    /// Only on the single designated thread.
    Designated,
    /// On any thread of the worker pool.
    AnyWorker,
}

/// Decides a task's [`Affinity`] when it becomes ready, not when the graph
/// is built, so it can depend on the session's state at that moment.
pub(crate) type AffinityFn = dyn Fn(&Session) -> Affinity + Send + Sync;

/// The collaborator a task calls into.
pub(crate) enum Work {
    None,
    Translate(Option<Arc<dyn Translator>>),
    Pipeline(Arc<dyn Pipeline>),
    Create {
        key: ObjectKey,
        kind: Kind,
        factory: Arc<dyn Factory>,
        container: String,
    },
    PostPipeline {
        key: ObjectKey,
        pipeline: Arc<dyn Pipeline>,
    },
}

/// One schedulable unit of work.
pub(crate) struct TaskDescriptor {
    pub kind: TaskKind,
    pub label: String,
    pub source: Option<usize>,
    pub work: Work,
    pub affinity: Box<AffinityFn>,
}

impl TaskDescriptor {
    pub fn new(kind: TaskKind, label: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
            source: None,
            work: Work::None,
            affinity: Box::new(|_| Affinity::Designated),
        }
    }

    pub fn source(mut self, source: usize) -> Self {
        self.source = Some(source);
        self
    }

    pub fn work(mut self, work: Work) -> Self {
        self.work = work;
        self
    }

    pub fn affinity<F>(mut self, affinity: F) -> Self
    where
        F: Fn(&Session) -> Affinity + Send + Sync + 'static,
    {
        self.affinity = Box::new(affinity);
        self
    }

    pub fn node(&self) -> Option<&NodeId> {
        match &self.work {
            Work::Create { key, .. } | Work::PostPipeline { key, .. } => Some(&key.node),
            _ => None,
        }
    }
}

/// What a finished task hands back to the scheduler.
pub(crate) enum TaskOutcome {
    Done,
    /// The session was cancelled, the task did nothing.
    Skipped,
    /// The creation layer computed by `Parse`.
    Plan(builder::Plan),
}
