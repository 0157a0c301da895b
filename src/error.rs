use std::fmt;
use std::sync::Arc;

pub use anyhow::Error as RuntimeError;
use thiserror::Error;

use crate::core::{Kind, NodeId, SourceHandle};

/// An error returned by an external collaborator (factory, pipeline,
/// translator or container store), shareable between the session state and
/// every snapshot of its diagnostics.
#[derive(Debug, Clone)]
pub struct CollaboratorError(pub(crate) Arc<anyhow::Error>);

impl CollaboratorError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }
}

impl From<anyhow::Error> for CollaboratorError {
    fn from(e: anyhow::Error) -> Self {
        CollaboratorError(Arc::new(e))
    }
}

impl fmt::Display for CollaboratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl std::error::Error for CollaboratorError {}

/// Errors surfaced by the public API of the import manager itself.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Couldn't parse configuration.\n{0}")]
    ConfigFormat(#[from] serde_json::Error),

    #[error("Failed to build the worker pool.\n{0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("Failed to spawn the designated thread.\n{0}")]
    Spawn(#[from] std::io::Error),

    #[error("Couldn't compile glob pattern.\n{0}")]
    GlobPattern(#[from] glob::PatternError),

    #[error("Invalid progress bar template.\n{0}")]
    Template(#[from] indicatif::style::TemplateError),

    #[cfg(feature = "logging")]
    #[error("Failed to install the tracing subscriber.\n{0}")]
    Logging(#[from] tracing_subscriber::util::TryInitError),
}

/// A non-fatal problem recorded against one import session.
///
/// Task-local failures never cross task boundaries as errors; they end up
/// here, attached to the session's [`ImportFuture`](crate::ImportFuture).
#[derive(Debug, Error, Clone)]
pub enum Diagnostic {
    #[error("No registered translator can read '{input}'")]
    UnsupportedSource { input: SourceHandle },

    #[error("Translator '{translator}' failed on '{input}':\n{error}")]
    TranslationFailed {
        translator: String,
        input: SourceHandle,
        error: CollaboratorError,
    },

    #[error("Pipeline '{pipeline}' failed{}:\n{error}", on_node(.node))]
    PipelineFailed {
        pipeline: String,
        node: Option<NodeId>,
        error: CollaboratorError,
    },

    #[error("Node '{node}' has kind '{kind}', but no factory is registered for it")]
    UnresolvedNode { node: NodeId, kind: Kind },

    #[error("Node '{node}' targets container '{container}', which collides with '{existing}'")]
    NameCollision {
        node: NodeId,
        container: String,
        existing: String,
    },

    #[error("Dependency cycle between nodes {nodes:?}, edges inside the cycle were dropped")]
    DependencyCycle { nodes: Vec<NodeId> },

    #[error("Container '{container}' for node '{node}' couldn't be allocated:\n{error}")]
    ContainerFailed {
        node: NodeId,
        container: String,
        error: CollaboratorError,
    },

    #[error("Factory produced no placeholder for node '{node}'{}", reason(.error))]
    PlaceholderFailed {
        node: NodeId,
        error: Option<CollaboratorError>,
    },

    #[error("Factory failed to populate node '{node}'{}", reason(.error))]
    PopulateFailed {
        node: NodeId,
        error: Option<CollaboratorError>,
    },

    #[error("Factory failed to finish node '{node}':\n{error}")]
    FinishFailed {
        node: NodeId,
        error: CollaboratorError,
    },

    #[error("Container '{container}' couldn't be published:\n{error}")]
    PublishFailed {
        container: String,
        error: CollaboratorError,
    },

    #[error("Task '{task}' panicked: {message}")]
    TaskPanicked { task: String, message: String },
}

impl Diagnostic {
    /// The node this diagnostic is about, if it concerns a single node.
    pub fn node(&self) -> Option<&NodeId> {
        match self {
            Diagnostic::UnresolvedNode { node, .. }
            | Diagnostic::NameCollision { node, .. }
            | Diagnostic::ContainerFailed { node, .. }
            | Diagnostic::PlaceholderFailed { node, .. }
            | Diagnostic::PopulateFailed { node, .. }
            | Diagnostic::FinishFailed { node, .. } => Some(node),
            Diagnostic::PipelineFailed { node, .. } => node.as_ref(),
            _ => None,
        }
    }
}

fn on_node(node: &Option<NodeId>) -> String {
    match node {
        Some(node) => format!(" on node '{node}'"),
        None => String::new(),
    }
}

fn reason(error: &Option<CollaboratorError>) -> String {
    match error {
        Some(error) => format!(":\n{error}"),
        None => String::new(),
    }
}
