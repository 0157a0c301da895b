//! What every kind of task does once it is dispatched.
//!
//! Failures of external collaborators end up as diagnostics on the session
//! future, a task always completes normally so the graph keeps flowing.
use std::sync::Arc;

use crate::core::Kind;
use crate::engine::runner::Shared;
use crate::engine::{TaskDescriptor, TaskKind, TaskOutcome, Work, builder};
use crate::error::{CollaboratorError, Diagnostic};
use crate::registry::{CreateContext, Factory, Pipeline, Translator};
use crate::session::{ObjectKey, Session};

pub(crate) fn run(task: &TaskDescriptor, session: &Session, shared: &Shared) -> TaskOutcome {
    if !session.should_run(task.kind) {
        tracing::trace!("skipped, session cancelled");
        return TaskOutcome::Skipped;
    }

    match (task.kind, &task.work) {
        (TaskKind::Translate, Work::Translate(translator)) => {
            translate(session, source_of(task), translator.as_ref())
        }
        (TaskKind::PrePipeline, Work::Pipeline(pipeline)) => {
            pre_pipeline(session, source_of(task), pipeline)
        }
        (TaskKind::Parse, _) => TaskOutcome::Plan(builder::plan(
            session,
            &shared.registry,
            shared.containers.as_ref(),
        )),
        (TaskKind::BuildContainer, Work::Create { key, container, .. }) => {
            build_container(session, shared, key, container)
        }
        (TaskKind::CreatePlaceholder, Work::Create { key, kind, factory, .. }) => {
            create_placeholder(session, key, kind, factory)
        }
        (TaskKind::Populate, Work::Create { key, kind, factory, .. }) => {
            populate(session, key, kind, factory)
        }
        (TaskKind::PostPipeline, Work::PostPipeline { key, pipeline }) => {
            post_pipeline(session, key, pipeline)
        }
        (TaskKind::PreFinalize, _) => pre_finalize(session),
        (TaskKind::Finalize, _) => finalize(session, shared),
        (kind, _) => panic!("task '{}' of kind {kind:?} carries the wrong work", task.label),
    }
}

fn source_of(task: &TaskDescriptor) -> usize {
    task.source
        .unwrap_or_else(|| panic!("task '{}' is not bound to a source", task.label))
}

fn translate(session: &Session, source: usize, translator: Option<&Arc<dyn Translator>>) -> TaskOutcome {
    let input = &session.sources[source];

    let Some(translator) = translator else {
        tracing::warn!(%input, "no translator accepts the source");
        session
            .future
            .add_diagnostic(Diagnostic::UnsupportedSource { input: input.clone() });
        return TaskOutcome::Done;
    };

    match translator.translate(input) {
        Ok(graph) => {
            tracing::debug!(%input, nodes = graph.len(), "translated");
            *session.graph_mut(source) = graph;
        }
        Err(e) => {
            tracing::warn!(%input, "translation failed: {e:#}");
            session.future.add_diagnostic(Diagnostic::TranslationFailed {
                translator: translator.name().to_string(),
                input: input.clone(),
                error: CollaboratorError::from(e),
            });
        }
    }

    TaskOutcome::Done
}

fn pre_pipeline(session: &Session, source: usize, pipeline: &Arc<dyn Pipeline>) -> TaskOutcome {
    let mut graph = session.graph_mut(source);

    if let Err(e) = pipeline.pre_import(&mut graph, &session.sources[source]) {
        tracing::warn!(pipeline = pipeline.name(), "pre-import failed: {e:#}");
        session.future.add_diagnostic(Diagnostic::PipelineFailed {
            pipeline: pipeline.name().to_string(),
            node: None,
            error: CollaboratorError::from(e),
        });
    }

    TaskOutcome::Done
}

fn build_container(session: &Session, shared: &Shared, key: &ObjectKey, container: &str) -> TaskOutcome {
    // A re-import writes into the container its target already lives in.
    if session.is_reimport() {
        session.record_container(key.clone(), container.to_string(), false);
        return TaskOutcome::Done;
    }

    match shared.containers.allocate(container) {
        Ok(()) => session.record_container(key.clone(), container.to_string(), true),
        Err(e) => {
            tracing::warn!(node = %key.node, %container, "allocation failed: {e:#}");
            session.future.add_diagnostic(Diagnostic::ContainerFailed {
                node: key.node.clone(),
                container: container.to_string(),
                error: CollaboratorError::from(e),
            });
        }
    }

    TaskOutcome::Done
}

/// Calls `f` with the creation context of a node. Returns `None` when the
/// node disappeared from its graph.
fn with_context<R>(
    session: &Session,
    key: &ObjectKey,
    kind: &Kind,
    f: impl FnOnce(&CreateContext<'_>) -> R,
) -> Option<R> {
    let container = session.container(key)?;
    let node = session.node_snapshot(key)?;
    let dependencies = session.dependency_objects(key.source, node.dependencies());

    let ctx = CreateContext {
        node: &node,
        kind,
        source: &session.sources[key.source],
        container: &container,
        dependencies: &dependencies,
        reimport: session.reimport.as_ref(),
    };

    Some(f(&ctx))
}

fn create_placeholder(
    session: &Session,
    key: &ObjectKey,
    kind: &Kind,
    factory: &Arc<dyn Factory>,
) -> TaskOutcome {
    // No container means preparing it failed, the node is dropped.
    let Some(result) = with_context(session, key, kind, |ctx| factory.create_placeholder(ctx)) else {
        return TaskOutcome::Done;
    };

    match result {
        // Registered even if the session got cancelled meanwhile, so that
        // finalization reverts it.
        Ok(Some(object)) => session.register_placeholder(key.clone(), factory.clone(), object),
        Ok(None) => {
            tracing::warn!(node = %key.node, "no placeholder created");
            session.future.add_diagnostic(Diagnostic::PlaceholderFailed {
                node: key.node.clone(),
                error: None,
            });
        }
        Err(e) => {
            tracing::warn!(node = %key.node, "placeholder failed: {e:#}");
            session.future.add_diagnostic(Diagnostic::PlaceholderFailed {
                node: key.node.clone(),
                error: Some(CollaboratorError::from(e)),
            });
        }
    }

    TaskOutcome::Done
}

fn populate(session: &Session, key: &ObjectKey, kind: &Kind, factory: &Arc<dyn Factory>) -> TaskOutcome {
    let Some(placeholder) = session.placeholder(key) else {
        return TaskOutcome::Done;
    };

    let Some(result) = with_context(session, key, kind, |ctx| factory.populate(ctx, placeholder)) else {
        return TaskOutcome::Done;
    };

    let error = match result {
        Ok(Some(object)) => {
            if !session.publish_populated(key, object) {
                tracing::debug!(node = %key.node, "populated after cancellation, held back");
            }
            return TaskOutcome::Done;
        }
        Ok(None) => None,
        Err(e) => Some(CollaboratorError::from(e)),
    };

    tracing::warn!(node = %key.node, "populate failed");
    session.future.add_diagnostic(Diagnostic::PopulateFailed {
        node: key.node.clone(),
        error,
    });

    TaskOutcome::Done
}

fn post_pipeline(session: &Session, key: &ObjectKey, pipeline: &Arc<dyn Pipeline>) -> TaskOutcome {
    let Some(object) = session.object(key) else {
        return TaskOutcome::Done;
    };

    let mut graph = session.graph_mut(key.source);
    if let Err(e) = pipeline.post_import(&mut graph, &key.node, &object) {
        tracing::warn!(pipeline = pipeline.name(), node = %key.node, "post-import failed: {e:#}");
        session.future.add_diagnostic(Diagnostic::PipelineFailed {
            pipeline: pipeline.name().to_string(),
            node: Some(key.node.clone()),
            error: CollaboratorError::from(e),
        });
    }

    TaskOutcome::Done
}

fn pre_finalize(session: &Session) -> TaskOutcome {
    if session.is_cancelled() {
        return TaskOutcome::Done;
    }

    for (key, factory, object, populated) in session.created() {
        if !populated {
            continue;
        }

        if let Err(e) = factory.finish(&object) {
            tracing::warn!(node = %key.node, "finish failed: {e:#}");
            session.future.add_diagnostic(Diagnostic::FinishFailed {
                node: key.node,
                error: CollaboratorError::from(e),
            });
        }
    }

    TaskOutcome::Done
}

fn finalize(session: &Session, shared: &Shared) -> TaskOutcome {
    let cancelled = session.is_cancelled();
    let created = session.take_created();

    // Placeholders that never got populated are reverted either way.
    let mut kept: Vec<&ObjectKey> = Vec::new();
    for (key, entry) in &created {
        if cancelled || !entry.populated {
            entry.factory.discard(&entry.object);
        } else {
            kept.push(key);
        }
    }

    let mut published = 0;
    for (key, container) in session.take_containers() {
        if !kept.contains(&&key) {
            shared.containers.discard(&container);
            continue;
        }

        match shared.containers.publish(&container) {
            Ok(()) => published += 1,
            Err(e) => {
                tracing::warn!(%container, "publish failed: {e:#}");
                shared.containers.discard(&container);
                session.future.add_diagnostic(Diagnostic::PublishFailed {
                    container,
                    error: CollaboratorError::from(e),
                });
            }
        }
    }

    if cancelled {
        tracing::info!(reverted = created.len(), "import cancelled");
    } else {
        tracing::info!(objects = kept.len(), containers = published, "import finished");
    }

    TaskOutcome::Done
}

