//! Capability objects the scheduler drives, and the registry mapping kinds
//! and names to them.
//!
//! The scheduler knows nothing about file formats or object semantics. It
//! only calls into three small interfaces:
//!
//! * [`Translator`]: turns a source into a [`NodeGraph`].
//! * [`Pipeline`]: transforms the graph before objects exist (pre-stage) and
//!   reacts to each created object (post-stage).
//! * [`Factory`]: creates an empty placeholder for a node, then populates it.
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use glob::Pattern;

use crate::core::{Kind, Node, NodeGraph, NodeId, Object, SourceHandle};
use crate::error::ImportError;

/// Everything a factory gets to see while creating one node.
pub struct CreateContext<'a> {
    pub(crate) node: &'a Node,
    pub(crate) kind: &'a Kind,
    pub(crate) source: &'a SourceHandle,
    pub(crate) container: &'a str,
    pub(crate) dependencies: &'a [(NodeId, Option<Object>)],
    pub(crate) reimport: Option<&'a Object>,
}

impl<'a> CreateContext<'a> {
    pub fn node(&self) -> &'a Node {
        self.node
    }

    pub fn source(&self) -> &'a SourceHandle {
        self.source
    }

    /// Path of the container the object is created in.
    pub fn container(&self) -> &'a str {
        self.container
    }

    /// The existing object being re-imported, if this is a re-import.
    pub fn reimport(&self) -> Option<&'a Object> {
        self.reimport
    }

    /// The object created for a dependency of this node.
    ///
    /// Returns `None` when the dependency was dropped or failed to import,
    /// factories are expected to tolerate that.
    pub fn dependency(&self, id: &NodeId) -> Option<&'a Object> {
        self.dependencies
            .iter()
            .find(|(dep, _)| dep == id)
            .and_then(|(_, object)| object.as_ref())
    }

    /// All declared dependencies, paired with their objects when available.
    pub fn dependencies(&self) -> impl Iterator<Item = (&'a NodeId, Option<&'a Object>)> {
        self.dependencies
            .iter()
            .map(|(id, object)| (id, object.as_ref()))
    }

    /// Builds an object identified as the product of this node.
    pub fn object<T>(&self, payload: T) -> Object
    where
        T: Any + Send + Sync,
    {
        Object::new(
            self.kind.clone(),
            self.node.id().clone(),
            self.container,
            self.node.display_name(),
            payload,
        )
    }
}

/// Creates objects of one [`Kind`].
pub trait Factory: Send + Sync {
    /// Creates an empty object which dependents may already refer to.
    /// Returning `Ok(None)` drops the node.
    fn create_placeholder(&self, ctx: &CreateContext<'_>) -> anyhow::Result<Option<Object>>;

    /// Fills the placeholder with data, returning the finished object.
    fn populate(
        &self,
        ctx: &CreateContext<'_>,
        placeholder: Object,
    ) -> anyhow::Result<Option<Object>>;

    /// Whether [`populate`](Self::populate) may run off the designated thread.
    fn can_run_on_any_thread(&self) -> bool {
        false
    }

    /// Called on the designated thread once every object of the session has
    /// been populated.
    fn finish(&self, _object: &Object) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called on the designated thread when the session finalizes, for
    /// every object of this factory that is not kept: all of them if the
    /// session was cancelled, otherwise the placeholders whose populate
    /// step failed.
    fn discard(&self, _object: &Object) {}
}

/// A transformation pass over node graphs.
pub trait Pipeline: Send + Sync {
    fn name(&self) -> &str;

    /// Runs before any object exists, with exclusive access to the graph.
    fn pre_import(&self, _graph: &mut NodeGraph, _source: &SourceHandle) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs once per created object.
    fn post_import(
        &self,
        _graph: &mut NodeGraph,
        _node: &NodeId,
        _object: &Object,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Whether [`post_import`](Self::post_import) should be scheduled at all.
    fn has_post_import(&self) -> bool {
        false
    }

    fn can_run_on_any_thread(&self) -> bool {
        true
    }
}

/// Reads one source into a [`NodeGraph`].
pub trait Translator: Send + Sync {
    fn name(&self) -> &str;

    fn can_translate(&self, source: &SourceHandle) -> bool;

    fn translate(&self, source: &SourceHandle) -> anyhow::Result<NodeGraph>;

    fn can_run_on_any_thread(&self) -> bool {
        true
    }
}

type TranslateFn = dyn Fn(&SourceHandle) -> anyhow::Result<NodeGraph> + Send + Sync;

/// A [`Translator`] built from a closure, accepting sources whose path
/// matches one of its glob patterns.
pub struct FnTranslator {
    name: String,
    patterns: Vec<Pattern>,
    callback: Box<TranslateFn>,
}

impl FnTranslator {
    pub fn new<F>(
        name: impl Into<String>,
        patterns: &[&str],
        callback: F,
    ) -> Result<Self, ImportError>
    where
        F: Fn(&SourceHandle) -> anyhow::Result<NodeGraph> + Send + Sync + 'static,
    {
        Ok(Self {
            name: name.into(),
            patterns: patterns
                .iter()
                .map(|p| Pattern::new(p))
                .collect::<Result<_, _>>()?,
            callback: Box::new(callback),
        })
    }
}

impl Translator for FnTranslator {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_translate(&self, source: &SourceHandle) -> bool {
        self.patterns
            .iter()
            .any(|pattern| pattern.matches(source.path().as_str()))
    }

    fn translate(&self, source: &SourceHandle) -> anyhow::Result<NodeGraph> {
        (self.callback)(source)
    }
}

/// Registered capabilities. Registration is idempotent, registering a kind
/// or name a second time keeps the first entry.
#[derive(Default)]
pub(crate) struct Registry {
    factories: RwLock<HashMap<Kind, Arc<dyn Factory>>>,
    pipelines: RwLock<Vec<Arc<dyn Pipeline>>>,
    translators: RwLock<Vec<Arc<dyn Translator>>>,
}

impl Registry {
    pub fn register_factory(&self, kind: Kind, factory: Arc<dyn Factory>) -> bool {
        let mut factories = self
            .factories
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if factories.contains_key(&kind) {
            return false;
        }

        factories.insert(kind, factory);
        true
    }

    pub fn register_pipeline(&self, pipeline: Arc<dyn Pipeline>) -> bool {
        let mut pipelines = self
            .pipelines
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if pipelines.iter().any(|p| p.name() == pipeline.name()) {
            return false;
        }

        pipelines.push(pipeline);
        true
    }

    pub fn register_translator(&self, translator: Arc<dyn Translator>) -> bool {
        let mut translators = self
            .translators
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if translators.iter().any(|t| t.name() == translator.name()) {
            return false;
        }

        translators.push(translator);
        true
    }

    pub fn factory(&self, kind: &Kind) -> Option<Arc<dyn Factory>> {
        self.factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .cloned()
    }

    /// Registered pipelines, in registration order.
    pub fn pipelines(&self) -> Vec<Arc<dyn Pipeline>> {
        self.pipelines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The first registered translator accepting the source.
    pub fn translator_for(&self, source: &SourceHandle) -> Option<Arc<dyn Translator>> {
        self.translators
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|t| t.can_translate(source))
            .cloned()
    }
}
