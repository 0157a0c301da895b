use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

/// A type-erased, thread-safe container.
pub(crate) type Dynamic = Arc<dyn Any + Send + Sync>;

/// Atomic reference-counted string type used for identifiers.
pub(crate) type ArcStr = Arc<str>;

macro_rules! identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
        #[serde(transparent)]
        pub struct $name(ArcStr);

        impl $name {
            pub fn new(value: impl AsRef<str>) -> Self {
                Self(value.as_ref().into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.into())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value.into())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:?})", stringify!($name), &*self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

identifier! {
    /// Stable identity of a [`Node`] inside one translated source graph.
    NodeId
}

identifier! {
    /// The family an object belongs to. A node's kind selects the
    /// [`Factory`](crate::Factory) that is going to create it.
    Kind
}

/// A handle to a source the caller wants imported, usually a file.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SourceHandle {
    path: Utf8PathBuf,
}

impl SourceHandle {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// File stem of the source, used as a fallback display name.
    pub fn stem(&self) -> &str {
        self.path.file_stem().unwrap_or(self.path.as_str())
    }
}

impl fmt::Display for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path.as_str())
    }
}

/// One element of a translated source graph: a thing that may become an
/// object once a factory for its kind is registered.
#[derive(Clone, Debug)]
pub struct Node {
    id: NodeId,
    name: String,
    kind: Option<Kind>,
    dependencies: Vec<NodeId>,
    attributes: BTreeMap<String, String>,
    reference: Option<Object>,
}

impl Node {
    pub fn new(id: impl Into<NodeId>) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            kind: None,
            dependencies: Vec::new(),
            attributes: BTreeMap::new(),
            reference: None,
        }
    }

    /// Sets the name used for the container this node is created in.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn kind(mut self, kind: impl Into<Kind>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn depends_on(mut self, id: impl Into<NodeId>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn display_name(&self) -> &str {
        &self.name
    }

    pub fn target_kind(&self) -> Option<&Kind> {
        self.kind.as_ref()
    }

    pub fn dependencies(&self) -> &[NodeId] {
        &self.dependencies
    }

    pub fn get_attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// The object created for this node, once its populate step succeeded.
    pub fn reference(&self) -> Option<&Object> {
        self.reference.as_ref()
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn set_kind(&mut self, kind: Option<Kind>) {
        self.kind = kind;
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn add_dependency(&mut self, id: impl Into<NodeId>) {
        self.dependencies.push(id.into());
    }

    pub(crate) fn set_reference(&mut self, object: Object) {
        self.reference = Some(object);
    }
}

/// The in-memory graph a translator produces for one source.
///
/// Nodes keep their insertion order, which the dependency sorter uses as the
/// final tie-break.
#[derive(Clone, Debug, Default)]
pub struct NodeGraph {
    nodes: Vec<Node>,
    index: HashMap<NodeId, usize>,
}

impl NodeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a node, replacing (in place) any node with the same identity.
    pub fn insert(&mut self, node: Node) -> Option<Node> {
        match self.index.get(node.id()) {
            Some(&i) => Some(std::mem::replace(&mut self.nodes[i], node)),
            None => {
                self.index.insert(node.id().clone(), self.nodes.len());
                self.nodes.push(node);
                None
            }
        }
    }

    pub fn with(mut self, node: Node) -> Self {
        self.insert(node);
        self
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<Node> {
        let i = self.index.remove(id)?;
        let node = self.nodes.remove(i);
        for slot in self.index.values_mut() {
            if *slot > i {
                *slot -= 1;
            }
        }
        Some(node)
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.index.get(id).map(|&i| &mut self.nodes[i])
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

struct ObjectInner {
    kind: Kind,
    origin: NodeId,
    container: String,
    name: String,
    payload: Dynamic,
}

/// An object produced by a factory.
///
/// Cheap to clone; clones share the same payload. The payload is opaque to
/// the scheduler and is reached through [`Object::downcast_ref`].
#[derive(Clone)]
pub struct Object {
    inner: Arc<ObjectInner>,
}

impl Object {
    pub fn new<T>(
        kind: impl Into<Kind>,
        origin: impl Into<NodeId>,
        container: impl Into<String>,
        name: impl Into<String>,
        payload: T,
    ) -> Self
    where
        T: Any + Send + Sync,
    {
        Self {
            inner: Arc::new(ObjectInner {
                kind: kind.into(),
                origin: origin.into(),
                container: container.into(),
                name: name.into(),
                payload: Arc::new(payload),
            }),
        }
    }

    /// Returns a new object with the same identity and a different payload.
    pub fn with_payload<T>(&self, payload: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self {
            inner: Arc::new(ObjectInner {
                kind: self.inner.kind.clone(),
                origin: self.inner.origin.clone(),
                container: self.inner.container.clone(),
                name: self.inner.name.clone(),
                payload: Arc::new(payload),
            }),
        }
    }

    pub fn kind(&self) -> &Kind {
        &self.inner.kind
    }

    /// The node this object was created from.
    pub fn origin(&self) -> &NodeId {
        &self.inner.origin
    }

    /// Path of the container holding this object.
    pub fn container(&self) -> &str {
        &self.inner.container
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.payload.downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &Object) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("kind", &self.inner.kind)
            .field("origin", &self.inner.origin)
            .field("container", &self.inner.container)
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}
