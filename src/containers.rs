//! The persistence seam: containers are the named units (packages) objects
//! are stored in. Allocation must be serialized with the rest of the
//! persistence layer, which is why the scheduler only ever calls
//! [`Containers::allocate`] from the designated thread.
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use anyhow::bail;

/// External store of named containers.
pub trait Containers: Send + Sync {
    /// Returns the name of an unrelated, already persisted container that
    /// `path` would collide with.
    fn collision(&self, path: &str) -> Option<String>;

    /// Allocates a fresh container.
    fn allocate(&self, path: &str) -> anyhow::Result<()>;

    /// Makes an allocated container visible to the rest of the system.
    fn publish(&self, path: &str) -> anyhow::Result<()>;

    /// Throws an allocated container away.
    fn discard(&self, path: &str);
}

#[derive(Default)]
struct State {
    reserved: HashSet<String>,
    allocated: HashSet<String>,
    published: HashSet<String>,
}

/// In-memory [`Containers`], the default store of an
/// [`ImportManager`](crate::ImportManager).
///
/// Container names are compared case-insensitively.
#[derive(Default)]
pub struct MemoryContainers {
    state: Mutex<State>,
}

impl MemoryContainers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a name as taken by something the importer does not own.
    pub fn reserve(&self, path: impl Into<String>) {
        self.lock().reserved.insert(path.into());
    }

    pub fn is_allocated(&self, path: &str) -> bool {
        self.lock().allocated.contains(&key(path))
    }

    pub fn is_published(&self, path: &str) -> bool {
        self.lock().published.contains(&key(path))
    }

    /// Containers allocated and neither published nor discarded yet.
    pub fn pending(&self) -> usize {
        self.lock().allocated.len()
    }

    pub fn published(&self) -> Vec<String> {
        let mut list: Vec<_> = self.lock().published.iter().cloned().collect();
        list.sort();
        list
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn key(path: &str) -> String {
    path.to_lowercase()
}

impl Containers for MemoryContainers {
    fn collision(&self, path: &str) -> Option<String> {
        let wanted = key(path);
        self.lock()
            .reserved
            .iter()
            .find(|name| key(name) == wanted)
            .cloned()
    }

    fn allocate(&self, path: &str) -> anyhow::Result<()> {
        if let Some(existing) = self.collision(path) {
            bail!("name is reserved by '{existing}'");
        }

        let mut state = self.lock();
        if !state.allocated.insert(key(path)) {
            bail!("container '{path}' is already being imported");
        }

        Ok(())
    }

    fn publish(&self, path: &str) -> anyhow::Result<()> {
        let mut state = self.lock();
        if !state.allocated.remove(&key(path)) {
            bail!("container '{path}' was never allocated");
        }

        state.published.insert(key(path));
        Ok(())
    }

    fn discard(&self, path: &str) {
        self.lock().allocated.remove(&key(path));
    }
}
