#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod config;
mod containers;
mod core;
mod engine;
mod error;
mod future;
mod manager;
mod registry;
mod session;
mod utils;

#[cfg(test)]
mod testing;

pub use crate::config::ImportConfig;
pub use crate::containers::{Containers, MemoryContainers};
pub use crate::core::{Kind, Node, NodeGraph, NodeId, Object, SourceHandle};
pub use crate::engine::{Affinity, TaskKind, TaskRecord, Timeline};
pub use crate::error::{CollaboratorError, Diagnostic, ImportError, RuntimeError};
pub use crate::future::{ImportFuture, ImportStatus};
pub use crate::manager::ImportManager;
pub use crate::registry::{CreateContext, Factory, FnTranslator, Pipeline, Translator};
pub use crate::session::ImportRequest;
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
