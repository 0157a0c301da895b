use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use camino::Utf8PathBuf;

use crate::core::{Node, NodeGraph, NodeId, Object, SourceHandle};
use crate::engine::TaskKind;
use crate::future::ImportFuture;
use crate::registry::{Factory, Pipeline};

/// What the caller wants imported.
///
/// ```rust
/// use yomikomi::ImportRequest;
///
/// let request = ImportRequest::new("/Game/Props")
///     .source("assets/chair.gltf")
///     .source("assets/table.gltf");
/// ```
#[derive(Clone)]
pub struct ImportRequest {
    pub(crate) sources: Vec<SourceHandle>,
    pub(crate) pipelines: Option<Vec<Arc<dyn Pipeline>>>,
    pub(crate) namespace: String,
    pub(crate) reimport: Option<Object>,
}

impl ImportRequest {
    /// Starts a request importing into `namespace`, the prefix of every
    /// container path the session allocates.
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            sources: Vec::new(),
            pipelines: None,
            namespace: namespace.into(),
            reimport: None,
        }
    }

    pub fn source(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.sources.push(SourceHandle::new(path));
        self
    }

    pub fn sources<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        self.sources.extend(paths.into_iter().map(SourceHandle::new));
        self
    }

    /// Runs these pipelines instead of the registered ones.
    pub fn pipelines(mut self, pipelines: Vec<Arc<dyn Pipeline>>) -> Self {
        self.pipelines = Some(pipelines);
        self
    }

    /// Imports the sources again into an existing object. Only the node the
    /// object was originally created from is imported, into the object's
    /// own container.
    pub fn reimport(mut self, target: Object) -> Self {
        self.reimport = Some(target);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Node identities are only unique within the graph of one source.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct ObjectKey {
    pub source: usize,
    pub node: NodeId,
}

struct ContainerEntry {
    path: String,
    allocated: bool,
}

pub(crate) struct Created {
    pub factory: Arc<dyn Factory>,
    pub object: Object,
    pub populated: bool,
}

/// All state exclusive to one import request, alive until its finalize
/// task has run.
pub(crate) struct Session {
    pub id: SessionId,
    pub sources: Vec<SourceHandle>,
    pub namespace: String,
    pub reimport: Option<Object>,
    pub pipelines: Vec<Arc<dyn Pipeline>>,
    pub future: ImportFuture,
    pub span: tracing::Span,
    graphs: Vec<RwLock<NodeGraph>>,
    containers: Mutex<HashMap<ObjectKey, ContainerEntry>>,
    objects: Mutex<BTreeMap<ObjectKey, Created>>,
    cancelled: AtomicBool,
}

impl Session {
    pub fn new(id: SessionId, request: ImportRequest, pipelines: Vec<Arc<dyn Pipeline>>) -> Self {
        let span = tracing::info_span!(
            "import",
            session = %id,
            sources = request.sources.len(),
            namespace = %request.namespace,
        );

        Self {
            id,
            graphs: request
                .sources
                .iter()
                .map(|_| RwLock::new(NodeGraph::new()))
                .collect(),
            sources: request.sources,
            namespace: request.namespace,
            reimport: request.reimport,
            pipelines: request.pipelines.unwrap_or(pipelines),
            future: ImportFuture::new(),
            span,
            containers: Mutex::new(HashMap::new()),
            objects: Mutex::new(BTreeMap::new()),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.future.mark_cancelled();
            tracing::debug!(parent: &self.span, "cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// The single check every task makes on entry. Once it returns `false`
    /// the task must not touch any session state.
    pub fn should_run(&self, kind: TaskKind) -> bool {
        !(kind.observes_cancellation() && self.is_cancelled())
    }

    pub fn is_reimport(&self) -> bool {
        self.reimport.is_some()
    }

    pub fn graph(&self, source: usize) -> RwLockReadGuard<'_, NodeGraph> {
        self.graphs[source]
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn graph_mut(&self, source: usize) -> RwLockWriteGuard<'_, NodeGraph> {
        self.graphs[source]
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// A copy of a node, so factories never run under the graph lock.
    pub fn node_snapshot(&self, key: &ObjectKey) -> Option<Node> {
        self.graph(key.source).get(&key.node).cloned()
    }

    pub fn record_container(&self, key: ObjectKey, path: String, allocated: bool) {
        self.lock_containers()
            .insert(key, ContainerEntry { path, allocated });
    }

    /// Path of the container prepared for a node, if preparing it succeeded.
    pub fn container(&self, key: &ObjectKey) -> Option<String> {
        self.lock_containers().get(key).map(|entry| entry.path.clone())
    }

    /// Every allocated container, with the key of the node it was made for.
    pub fn take_containers(&self) -> Vec<(ObjectKey, String)> {
        let mut list: Vec<_> = self
            .lock_containers()
            .drain()
            .filter(|(_, entry)| entry.allocated)
            .map(|(key, entry)| (key, entry.path))
            .collect();
        list.sort();
        list
    }

    /// Objects of the given dependencies, as far as they were populated.
    pub fn dependency_objects(
        &self,
        source: usize,
        dependencies: &[NodeId],
    ) -> Vec<(NodeId, Option<Object>)> {
        let objects = self.lock_objects();
        dependencies
            .iter()
            .map(|id| {
                let key = ObjectKey {
                    source,
                    node: id.clone(),
                };
                let object = objects
                    .get(&key)
                    .filter(|created| created.populated)
                    .map(|created| created.object.clone());
                (id.clone(), object)
            })
            .collect()
    }

    pub fn register_placeholder(&self, key: ObjectKey, factory: Arc<dyn Factory>, object: Object) {
        let previous = self.lock_objects().insert(
            key,
            Created {
                factory,
                object,
                populated: false,
            },
        );
        assert!(previous.is_none(), "placeholder created twice for one node");
    }

    pub fn placeholder(&self, key: &ObjectKey) -> Option<Object> {
        self.lock_objects()
            .get(key)
            .filter(|created| !created.populated)
            .map(|created| created.object.clone())
    }

    /// The populated object of a node.
    pub fn object(&self, key: &ObjectKey) -> Option<Object> {
        self.lock_objects()
            .get(key)
            .filter(|created| created.populated)
            .map(|created| created.object.clone())
    }

    /// Stores a populated object and fills the node's reference. The object
    /// only reaches the future if the session was not cancelled meanwhile.
    pub fn publish_populated(&self, key: &ObjectKey, object: Object) -> bool {
        {
            let mut objects = self.lock_objects();
            let created = objects
                .get_mut(key)
                .unwrap_or_else(|| panic!("node '{}' populated without a placeholder", key.node));
            created.object = object.clone();
            created.populated = true;
        }

        if let Some(node) = self.graph_mut(key.source).get_mut(&key.node) {
            node.set_reference(object.clone());
        }

        if self.is_cancelled() {
            return false;
        }

        self.future.add_object(object);
        true
    }

    /// Every registry entry, in node order.
    pub fn created(&self) -> Vec<(ObjectKey, Arc<dyn Factory>, Object, bool)> {
        self.lock_objects()
            .iter()
            .map(|(key, created)| {
                (
                    key.clone(),
                    created.factory.clone(),
                    created.object.clone(),
                    created.populated,
                )
            })
            .collect()
    }

    pub fn take_created(&self) -> BTreeMap<ObjectKey, Created> {
        std::mem::take(&mut *self.lock_objects())
    }

    fn lock_containers(&self) -> MutexGuard<'_, HashMap<ObjectKey, ContainerEntry>> {
        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_objects(&self) -> MutexGuard<'_, BTreeMap<ObjectKey, Created>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::CreateContext;

    struct Plain;

    impl Factory for Plain {
        fn create_placeholder(&self, ctx: &CreateContext<'_>) -> anyhow::Result<Option<Object>> {
            Ok(Some(ctx.object(())))
        }

        fn populate(&self, _: &CreateContext<'_>, placeholder: Object) -> anyhow::Result<Option<Object>> {
            Ok(Some(placeholder))
        }
    }

    fn session() -> Session {
        let request = ImportRequest::new("/Game").source("a.gltf");
        let session = Session::new(SessionId(1), request, Vec::new());
        session.graph_mut(0).insert(Node::new("a").kind("thing"));
        session.graph_mut(0).insert(Node::new("b").kind("thing").depends_on("a"));
        session
    }

    fn key(node: &str) -> ObjectKey {
        ObjectKey {
            source: 0,
            node: NodeId::from(node),
        }
    }

    fn object(node: &str) -> Object {
        Object::new("thing", node, format!("/Game/{node}"), node, ())
    }

    #[test]
    fn test_cancellation_gate() {
        let session = session();
        assert!(session.should_run(TaskKind::Populate));

        session.cancel();

        assert!(!session.should_run(TaskKind::Translate));
        assert!(!session.should_run(TaskKind::CreatePlaceholder));
        assert!(session.should_run(TaskKind::PreFinalize));
        assert!(session.should_run(TaskKind::Finalize));
        assert!(session.future.is_cancelled());
    }

    #[test]
    fn test_dependencies_see_only_populated_objects() {
        let session = session();
        session.register_placeholder(key("a"), Arc::new(Plain), object("a"));

        let deps = session.dependency_objects(0, &[NodeId::from("a"), NodeId::from("zzz")]);
        assert!(deps.iter().all(|(_, object)| object.is_none()));

        session.publish_populated(&key("a"), object("a"));
        let deps = session.dependency_objects(0, &[NodeId::from("a")]);
        assert!(deps[0].1.is_some());
        assert!(session.placeholder(&key("a")).is_none());
    }

    #[test]
    fn test_populated_object_fills_reference() {
        let session = session();
        session.register_placeholder(key("a"), Arc::new(Plain), object("a"));

        assert!(session.publish_populated(&key("a"), object("a")));

        let node = session.node_snapshot(&key("a")).unwrap();
        assert_eq!(node.reference().unwrap().origin().as_str(), "a");
        assert_eq!(session.future.imported_objects().len(), 1);
    }

    #[test]
    fn test_cancelled_session_keeps_object_out_of_future() {
        let session = session();
        session.register_placeholder(key("a"), Arc::new(Plain), object("a"));
        session.cancel();

        assert!(!session.publish_populated(&key("a"), object("a")));
        assert!(session.future.imported_objects().is_empty());
        assert_eq!(session.created().len(), 1);
    }

    #[test]
    fn test_only_allocated_containers_are_taken() {
        let session = session();
        session.record_container(key("a"), "/Game/a".into(), true);
        session.record_container(key("b"), "/Game/b".into(), false);

        assert_eq!(session.container(&key("b")).as_deref(), Some("/Game/b"));
        assert_eq!(session.take_containers(), vec![(key("a"), "/Game/a".to_string())]);
        assert!(session.container(&key("a")).is_none());
    }

    #[test]
    fn test_request_overrides_pipelines() {
        struct Named;
        impl Pipeline for Named {
            fn name(&self) -> &str {
                "named"
            }
        }

        let registered: Vec<Arc<dyn Pipeline>> = vec![Arc::new(Named), Arc::new(Named)];
        let request = ImportRequest::new("/Game").pipelines(Vec::new());
        let session = Session::new(SessionId(2), request, registered.clone());
        assert!(session.pipelines.is_empty());

        let session = Session::new(SessionId(3), ImportRequest::new("/Game"), registered);
        assert_eq!(session.pipelines.len(), 2);
    }
}
