//! The Task Graph Builder.
//!
//! The pre-stage layer is known as soon as a session is admitted. The
//! creation layer depends on what the translators and pipelines produced,
//! so it is planned by the `Parse` task on a worker, and wired into the
//! graph by the scheduler once `Parse` reports back.
use std::collections::HashMap;
use std::sync::Arc;

use petgraph::graph::NodeIndex;

use crate::containers::Containers;
use crate::core::Kind;
use crate::engine::graph::TaskGraph;
use crate::engine::sort::{self, SortItem};
use crate::engine::{Affinity, TaskDescriptor, TaskKind, Work};
use crate::error::Diagnostic;
use crate::registry::{Factory, Pipeline, Registry};
use crate::session::{ObjectKey, Session};

/// Tasks of the pre-stage layer the creation layer attaches to.
pub(crate) struct Layout {
    pub parse: NodeIndex,
    pub pre_finalize: NodeIndex,
    pub finalize: NodeIndex,
}

/// One node that is going to be created.
pub(crate) struct Record {
    pub key: ObjectKey,
    pub kind: Kind,
    pub factory: Arc<dyn Factory>,
    pub container: String,
    /// Earlier records whose terminal task this record has to wait for.
    pub prerequisites: Vec<usize>,
}

/// The creation layer of a session, records in scheduling order.
#[derive(Default)]
pub(crate) struct Plan {
    pub records: Vec<Record>,
}

impl Plan {
    pub fn len(&self) -> usize {
        self.records.len()
    }
}

fn worker_if(any_thread: bool) -> Affinity {
    if any_thread {
        Affinity::AnyWorker
    } else {
        Affinity::Designated
    }
}

fn designated_unless_reimport(session: &Session) -> Affinity {
    worker_if(session.is_reimport())
}

/// Builds the pre-stage layer: translate every source, run every pipeline
/// over every source one at a time, parse, and close the session.
pub(crate) fn build_pre_stage(graph: &mut TaskGraph, session: &Session, registry: &Registry) -> Layout {
    let mut previous = Vec::with_capacity(session.sources.len());

    for (i, source) in session.sources.iter().enumerate() {
        let translator = registry.translator_for(source);
        let any_thread = translator.as_ref().is_none_or(|t| t.can_run_on_any_thread());
        let label = match &translator {
            Some(t) => format!("translate {source} ({})", t.name()),
            None => format!("translate {source}"),
        };

        let task = TaskDescriptor::new(TaskKind::Translate, label)
            .source(i)
            .work(Work::Translate(translator))
            .affinity(move |_| worker_if(any_thread));

        previous.push(graph.add_task(task, &[]));
    }

    // Pipelines share the graphs they mutate, so the whole stage is a single
    // chain across every pipeline and every source.
    for pipeline in &session.pipelines {
        for (i, source) in session.sources.iter().enumerate() {
            let any_thread = pipeline.can_run_on_any_thread();
            let task = TaskDescriptor::new(
                TaskKind::PrePipeline,
                format!("pre-pipeline {} on {source}", pipeline.name()),
            )
            .source(i)
            .work(Work::Pipeline(pipeline.clone()))
            .affinity(move |_| worker_if(any_thread));

            let index = graph.add_task(task, &previous);
            previous = vec![index];
        }
    }

    let parse = graph.add_task(
        TaskDescriptor::new(TaskKind::Parse, "parse").affinity(|_| Affinity::AnyWorker),
        &previous,
    );
    let pre_finalize = graph.add_task(
        TaskDescriptor::new(TaskKind::PreFinalize, "pre-finalize"),
        &[parse],
    );
    let finalize = graph.add_task(
        TaskDescriptor::new(TaskKind::Finalize, "finalize"),
        &[pre_finalize],
    );

    Layout {
        parse,
        pre_finalize,
        finalize,
    }
}

/// Decides which nodes of the session become objects, and in what order.
///
/// Problems with single nodes are recorded on the session's future, the
/// affected nodes are left out of the plan.
pub(crate) fn plan(session: &Session, registry: &Registry, containers: &dyn Containers) -> Plan {
    let mut plan = Plan::default();
    // Lower-cased container path -> the path as first claimed.
    let mut claimed: HashMap<String, String> = HashMap::new();

    for source in 0..session.sources.len() {
        let graph = session.graph(source);
        let mut candidates = Vec::new();

        for node in graph.iter() {
            let Some(kind) = node.target_kind() else {
                continue;
            };

            if let Some(target) = &session.reimport {
                if node.id() != target.origin() || kind != target.kind() {
                    tracing::debug!(
                        parent: &session.span,
                        node = %node.id(),
                        "skipped, not the node being re-imported"
                    );
                    continue;
                }
            }

            let Some(factory) = registry.factory(kind) else {
                tracing::warn!(parent: &session.span, node = %node.id(), %kind, "no factory registered");
                session.future.add_diagnostic(Diagnostic::UnresolvedNode {
                    node: node.id().clone(),
                    kind: kind.clone(),
                });
                continue;
            };

            let container = match &session.reimport {
                Some(target) => target.container().to_string(),
                None => format!(
                    "{}/{}",
                    session.namespace.trim_end_matches('/'),
                    node.display_name()
                ),
            };

            if session.reimport.is_none() {
                let existing = containers.collision(&container).or_else(|| {
                    claimed.get(&container.to_lowercase()).cloned()
                });

                if let Some(existing) = existing {
                    tracing::warn!(
                        parent: &session.span,
                        node = %node.id(),
                        %container,
                        %existing,
                        "container name collision"
                    );
                    session.future.add_diagnostic(Diagnostic::NameCollision {
                        node: node.id().clone(),
                        container,
                        existing,
                    });
                    continue;
                }

                claimed.insert(container.to_lowercase(), container.clone());
            }

            candidates.push((node, kind.clone(), factory, container));
        }

        let items: Vec<SortItem> = candidates
            .iter()
            .map(|(node, ..)| SortItem {
                id: node.id(),
                dependencies: node.dependencies(),
            })
            .collect();

        let sorted = sort::sort(&items);

        for nodes in sorted.cycles {
            tracing::warn!(parent: &session.span, ?nodes, "dependency cycle broken");
            session
                .future
                .add_diagnostic(Diagnostic::DependencyCycle { nodes });
        }

        // Candidate position -> index of its record in the plan.
        let offset = plan.records.len();
        let mut placed = vec![0; candidates.len()];
        for (n, &i) in sorted.order.iter().enumerate() {
            placed[i] = offset + n;
        }

        for &i in &sorted.order {
            let (node, kind, factory, container) = &candidates[i];
            let mut prerequisites: Vec<usize> =
                sorted.prerequisites[i].iter().map(|&j| placed[j]).collect();
            prerequisites.sort_unstable();

            debug_assert!(prerequisites.iter().all(|&p| p < placed[i]));

            plan.records.push(Record {
                key: ObjectKey {
                    source,
                    node: node.id().clone(),
                },
                kind: kind.clone(),
                factory: factory.clone(),
                container: container.clone(),
                prerequisites,
            });
        }
    }

    tracing::debug!(parent: &session.span, records = plan.len(), "creation planned");
    plan
}

/// Wires the creation layer into a running session graph. Must happen
/// before `Parse` is marked completed.
pub(crate) fn wire_plan(graph: &mut TaskGraph, layout: &Layout, plan: Plan, session: &Session) {
    let post: Vec<Arc<dyn Pipeline>> = session
        .pipelines
        .iter()
        .filter(|p| p.has_post_import())
        .cloned()
        .collect();

    let mut terminals: Vec<NodeIndex> = Vec::with_capacity(plan.len());

    for record in plan.records {
        let node = record.key.node.clone();

        let build = graph.add_task(
            TaskDescriptor::new(TaskKind::BuildContainer, format!("build-container {node}"))
                .source(record.key.source)
                .work(Work::Create {
                    key: record.key.clone(),
                    kind: record.kind.clone(),
                    factory: record.factory.clone(),
                    container: record.container.clone(),
                })
                .affinity(designated_unless_reimport),
            &[layout.parse],
        );

        let mut gate = vec![build];
        gate.extend(record.prerequisites.iter().map(|&p| terminals[p]));

        let placeholder = graph.add_task(
            TaskDescriptor::new(TaskKind::CreatePlaceholder, format!("create-placeholder {node}"))
                .source(record.key.source)
                .work(Work::Create {
                    key: record.key.clone(),
                    kind: record.kind.clone(),
                    factory: record.factory.clone(),
                    container: record.container.clone(),
                })
                .affinity(designated_unless_reimport),
            &gate,
        );

        let any_thread = record.factory.can_run_on_any_thread();
        let mut last = graph.add_task(
            TaskDescriptor::new(TaskKind::Populate, format!("populate {node}"))
                .source(record.key.source)
                .work(Work::Create {
                    key: record.key.clone(),
                    kind: record.kind,
                    factory: record.factory,
                    container: record.container,
                })
                .affinity(move |_| worker_if(any_thread)),
            &[placeholder],
        );

        for pipeline in &post {
            let any_thread = pipeline.can_run_on_any_thread();
            last = graph.add_task(
                TaskDescriptor::new(
                    TaskKind::PostPipeline,
                    format!("post-pipeline {} on {node}", pipeline.name()),
                )
                .source(record.key.source)
                .work(Work::PostPipeline {
                    key: record.key.clone(),
                    pipeline: pipeline.clone(),
                })
                .affinity(move |_| worker_if(any_thread)),
                &[last],
            );
        }

        graph.add_prerequisite(layout.pre_finalize, last);
        terminals.push(last);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::containers::MemoryContainers;
    use crate::core::{Node, NodeGraph, Object};
    use crate::session::{ImportRequest, SessionId};
    use crate::testing::{TestFactory, TestPipeline};

    fn session(request: ImportRequest, graphs: Vec<NodeGraph>) -> Session {
        let session = Session::new(SessionId(1), request, Vec::new());
        for (i, graph) in graphs.into_iter().enumerate() {
            *session.graph_mut(i) = graph;
        }
        session
    }

    fn registry() -> Registry {
        let registry = Registry::default();
        registry.register_factory(Kind::from("thing"), Arc::new(TestFactory::default()));
        registry
    }

    fn names(plan: &Plan) -> Vec<&str> {
        plan.records.iter().map(|r| r.key.node.as_str()).collect()
    }

    #[test]
    fn test_plan_orders_and_links_records() {
        let graph = NodeGraph::new()
            .with(Node::new("b").kind("thing").depends_on("a"))
            .with(Node::new("c").kind("thing").depends_on("a"))
            .with(Node::new("a").kind("thing"))
            .with(Node::new("note"));
        let session = session(ImportRequest::new("/Game").source("x.gltf"), vec![graph]);

        let plan = plan(&session, &registry(), &MemoryContainers::new());

        assert_eq!(names(&plan), ["a", "b", "c"]);
        assert!(plan.records[0].prerequisites.is_empty());
        assert_eq!(plan.records[1].prerequisites, vec![0]);
        assert_eq!(plan.records[2].prerequisites, vec![0]);
        assert_eq!(plan.records[1].container, "/Game/b");
        assert!(session.future.diagnostics().is_empty());
    }

    #[test]
    fn test_plan_drops_unresolved_and_colliding_nodes() {
        let graph = NodeGraph::new()
            .with(Node::new("mesh").kind("unknown"))
            .with(Node::new("wall").kind("thing"))
            .with(Node::new("wall-copy").kind("thing").name("WALL"))
            .with(Node::new("door").kind("thing"));
        let session = session(ImportRequest::new("/Game/").source("x.gltf"), vec![graph]);

        let containers = MemoryContainers::new();
        containers.reserve("/Game/door");

        let plan = plan(&session, &registry(), &containers);

        assert_eq!(names(&plan), ["wall"]);
        let diagnostics = session.future.diagnostics();
        assert_eq!(diagnostics.len(), 3);
        assert!(matches!(&diagnostics[0], Diagnostic::UnresolvedNode { node, .. } if node.as_str() == "mesh"));
        assert!(matches!(
            &diagnostics[1],
            Diagnostic::NameCollision { node, existing, .. }
                if node.as_str() == "wall-copy" && existing == "/Game/wall"
        ));
        assert!(matches!(&diagnostics[2], Diagnostic::NameCollision { node, .. } if node.as_str() == "door"));
    }

    #[test]
    fn test_plan_keeps_sources_apart() {
        let first = NodeGraph::new()
            .with(Node::new("a").kind("thing").name("a1"))
            .with(Node::new("b").kind("thing").name("b1").depends_on("a"));
        let second = NodeGraph::new().with(Node::new("b").kind("thing").name("b2").depends_on("a"));
        let request = ImportRequest::new("/Game").source("1.gltf").source("2.gltf");
        let session = session(request, vec![first, second]);

        let plan = plan(&session, &registry(), &MemoryContainers::new());

        assert_eq!(plan.len(), 3);
        assert_eq!(plan.records[2].key.source, 1);
        // `a` of the first source is not a dependency of the second source.
        assert!(plan.records[2].prerequisites.is_empty());
    }

    #[test]
    fn test_plan_reimport_targets_single_node() {
        let graph = NodeGraph::new()
            .with(Node::new("a").kind("thing"))
            .with(Node::new("b").kind("thing"));
        let target = Object::new("thing", "b", "/Elsewhere/b_old", "b_old", ());
        let request = ImportRequest::new("/Game").source("x.gltf").reimport(target);
        let session = session(request, vec![graph]);

        let containers = MemoryContainers::new();
        containers.reserve("/Elsewhere/b_old");

        let plan = plan(&session, &registry(), &containers);

        assert_eq!(names(&plan), ["b"]);
        assert_eq!(plan.records[0].container, "/Elsewhere/b_old");
        assert!(session.future.diagnostics().is_empty());
    }

    #[test]
    fn test_pre_stage_chains_pipelines() {
        let request = ImportRequest::new("/Game")
            .source("1.gltf")
            .source("2.gltf")
            .pipelines(vec![
                Arc::new(TestPipeline::new("first")),
                Arc::new(TestPipeline::new("second")),
            ]);
        let session = session(request, Vec::new());
        let mut graph = TaskGraph::new();

        let layout = build_pre_stage(&mut graph, &session, &Registry::default());

        // Two translations, four pipeline runs, parse and the closing pair.
        assert_eq!(graph.len(), 9);
        let mut ready = graph.take_ready();
        assert_eq!(ready.len(), 2);

        let mut order = Vec::new();
        loop {
            for index in ready {
                graph.complete(index);
            }
            ready = graph.take_ready();
            match ready.as_slice() {
                [] => break,
                [one] => order.push(graph.task(*one).label.clone()),
                _ => panic!("pipeline stage ran in parallel"),
            }
        }

        assert_eq!(
            order,
            [
                "pre-pipeline first on 1.gltf",
                "pre-pipeline first on 2.gltf",
                "pre-pipeline second on 1.gltf",
                "pre-pipeline second on 2.gltf",
                "parse",
                "pre-finalize",
                "finalize",
            ]
        );
        assert_eq!(graph.task(layout.finalize).kind, TaskKind::Finalize);
    }

    #[test]
    fn test_wired_plan_gates_placeholder_on_dependency() {
        let graph = NodeGraph::new()
            .with(Node::new("a").kind("thing"))
            .with(Node::new("b").kind("thing").depends_on("a"));
        let session = session(ImportRequest::new("/Game").source("x.gltf"), vec![graph]);
        let registry = registry();

        let mut tasks = TaskGraph::new();
        let layout = build_pre_stage(&mut tasks, &session, &registry);
        let translate = tasks.take_ready();
        translate.into_iter().for_each(|i| tasks.complete(i));
        assert_eq!(tasks.take_ready(), vec![layout.parse]);

        let plan = plan(&session, &registry, &MemoryContainers::new());
        wire_plan(&mut tasks, &layout, plan, &session);
        tasks.complete(layout.parse);

        let mut seen = Vec::new();
        let mut ready = tasks.take_ready();
        while !ready.is_empty() {
            for index in ready {
                seen.push(tasks.task(index).label.clone());
                tasks.complete(index);
            }
            ready = tasks.take_ready();
        }

        let at = |label: &str| seen.iter().position(|l| l == label).unwrap();
        assert!(at("populate a") < at("create-placeholder b"));
        assert!(at("populate b") < at("pre-finalize"));
        assert_eq!(seen.last().map(String::as_str), Some("finalize"));
    }
}
