use std::sync::Arc;

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::engine::TaskDescriptor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Pending,
    Dispatched,
    Completed,
}

pub(crate) struct TaskNode {
    pub task: Arc<TaskDescriptor>,
    waiting: usize,
    state: TaskState,
}

/// The task graph of one session.
///
/// Every task counts the prerequisites it is still waiting for. Tasks whose
/// count drops to zero are collected in the ready list, from which the
/// scheduler takes them. The graph may grow while it runs, as long as new
/// edges only point at tasks that have not been dispatched yet.
#[derive(Default)]
pub(crate) struct TaskGraph {
    graph: DiGraph<TaskNode, ()>,
    ready: Vec<NodeIndex>,
    completed: usize,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&mut self, task: TaskDescriptor, prerequisites: &[NodeIndex]) -> NodeIndex {
        let index = self.graph.add_node(TaskNode {
            task: Arc::new(task),
            waiting: 0,
            state: TaskState::Pending,
        });

        for &prerequisite in prerequisites {
            self.link(prerequisite, index);
        }

        if self.graph[index].waiting == 0 {
            self.ready.push(index);
        }

        index
    }

    /// Makes `target` additionally wait for `prerequisite`.
    pub fn add_prerequisite(&mut self, target: NodeIndex, prerequisite: NodeIndex) {
        assert_eq!(
            self.graph[target].state,
            TaskState::Pending,
            "prerequisite added to task '{}' after it was dispatched",
            self.graph[target].task.label,
        );

        let was_ready = self.graph[target].waiting == 0;
        self.link(prerequisite, target);

        if was_ready && self.graph[target].waiting > 0 {
            self.ready.retain(|&i| i != target);
        }
    }

    fn link(&mut self, prerequisite: NodeIndex, target: NodeIndex) {
        if self.graph.contains_edge(prerequisite, target) {
            return;
        }

        self.graph.add_edge(prerequisite, target, ());
        if self.graph[prerequisite].state != TaskState::Completed {
            self.graph[target].waiting += 1;
        }
    }

    /// Takes every task whose prerequisites have all completed.
    pub fn take_ready(&mut self) -> Vec<NodeIndex> {
        let ready = std::mem::take(&mut self.ready);
        for &index in &ready {
            let node = &mut self.graph[index];
            assert!(
                node.state == TaskState::Pending && node.waiting == 0,
                "task '{}' dispatched with unresolved prerequisites",
                node.task.label,
            );
            node.state = TaskState::Dispatched;
        }
        ready
    }

    /// Marks a dispatched task as completed and releases its dependents.
    pub fn complete(&mut self, index: NodeIndex) {
        let node = &mut self.graph[index];
        assert_eq!(
            node.state,
            TaskState::Dispatched,
            "task '{}' completed without being dispatched, or twice",
            node.task.label,
        );
        node.state = TaskState::Completed;
        self.completed += 1;

        let dependents: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(index, Direction::Outgoing)
            .collect();

        for dependent in dependents {
            let node = &mut self.graph[dependent];
            node.waiting -= 1;
            if node.waiting == 0 {
                self.ready.push(dependent);
            }
        }
    }

    pub fn task(&self, index: NodeIndex) -> &Arc<TaskDescriptor> {
        &self.graph[index].task
    }

    pub fn prerequisites(&self, index: NodeIndex) -> Vec<usize> {
        let mut list: Vec<usize> = self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .map(|i| i.index())
            .collect();
        list.sort_unstable();
        list
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn completed(&self) -> usize {
        self.completed
    }
}
