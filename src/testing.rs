//! Collaborators for tests: factories that record what they were asked to
//! do, translators serving fixed graphs, and gates to hold a task in place.
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};

use anyhow::{anyhow, bail};

use crate::config::ImportConfig;
use crate::containers::{Containers, MemoryContainers};
use crate::core::{NodeGraph, NodeId, Object, SourceHandle};
use crate::manager::ImportManager;
use crate::registry::{CreateContext, Factory, FnTranslator, Pipeline};

const PATIENCE: Duration = Duration::from_secs(10);

/// Blocks tasks until the test lets them through.
#[derive(Clone)]
pub(crate) struct Gate {
    started_tx: Sender<String>,
    started_rx: Receiver<String>,
    open_tx: Sender<()>,
    open_rx: Receiver<()>,
}

impl Gate {
    pub fn new() -> Self {
        let (started_tx, started_rx) = unbounded();
        let (open_tx, open_rx) = unbounded();
        Self {
            started_tx,
            started_rx,
            open_tx,
            open_rx,
        }
    }

    /// Called by the held task: reports it arrived, then waits for a pass.
    pub fn enter(&self, name: &str) {
        self.started_tx.send(name.to_string()).unwrap();
        self.open_rx.recv_timeout(PATIENCE).expect("gate never opened");
    }

    pub fn wait_started(&self) -> String {
        self.started_rx
            .recv_timeout(PATIENCE)
            .expect("nothing arrived at the gate")
    }

    pub fn try_started(&self, timeout: Duration) -> Option<String> {
        self.started_rx.recv_timeout(timeout).ok()
    }

    /// Lets one held task through.
    pub fn release(&self) {
        self.open_tx.send(()).unwrap();
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub step: &'static str,
    pub node: String,
    pub thread: Option<String>,
    /// Declared dependencies, and whether their object was available.
    pub dependencies: Vec<(String, bool)>,
    pub reimport: bool,
}

/// A factory producing objects with a `String` payload.
#[derive(Default)]
pub(crate) struct TestFactory {
    any_thread: bool,
    refuse: HashSet<String>,
    panic_on: HashSet<String>,
    fail_populate: HashSet<String>,
    empty_populate: HashSet<String>,
    fail_finish: HashSet<String>,
    gate: Option<(String, Gate)>,
    pub calls: Mutex<Vec<Call>>,
    pub finished: Mutex<Vec<String>>,
    pub discarded: Mutex<Vec<String>>,
}

impl TestFactory {
    pub fn any_thread(mut self) -> Self {
        self.any_thread = true;
        self
    }

    /// Creates no placeholder for the node.
    pub fn refuse(mut self, node: &str) -> Self {
        self.refuse.insert(node.to_string());
        self
    }

    /// Panics while populating the node.
    pub fn panic_on(mut self, node: &str) -> Self {
        self.panic_on.insert(node.to_string());
        self
    }

    /// Returns an error while populating the node.
    pub fn fail_populate(mut self, node: &str) -> Self {
        self.fail_populate.insert(node.to_string());
        self
    }

    /// Returns no object while populating the node.
    pub fn empty_populate(mut self, node: &str) -> Self {
        self.empty_populate.insert(node.to_string());
        self
    }

    /// Returns an error from the finish hook of the node.
    pub fn fail_finish(mut self, node: &str) -> Self {
        self.fail_finish.insert(node.to_string());
        self
    }

    /// Holds populating the node at the gate.
    pub fn gate_on(mut self, node: &str, gate: Gate) -> Self {
        self.gate = Some((node.to_string(), gate));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call(&self, step: &str, node: &str) -> Option<Call> {
        self.calls()
            .into_iter()
            .find(|call| call.step == step && call.node == node)
    }

    pub fn discarded(&self) -> Vec<String> {
        let mut list = self.discarded.lock().unwrap().clone();
        list.sort();
        list
    }

    pub fn finished(&self) -> Vec<String> {
        let mut list = self.finished.lock().unwrap().clone();
        list.sort();
        list
    }

    fn log(&self, step: &'static str, ctx: &CreateContext<'_>) {
        self.calls.lock().unwrap().push(Call {
            step,
            node: ctx.node().id().to_string(),
            thread: std::thread::current().name().map(String::from),
            dependencies: ctx
                .dependencies()
                .map(|(id, object)| (id.to_string(), object.is_some()))
                .collect(),
            reimport: ctx.reimport().is_some(),
        });
    }
}

impl Factory for TestFactory {
    fn create_placeholder(&self, ctx: &CreateContext<'_>) -> anyhow::Result<Option<Object>> {
        self.log("placeholder", ctx);

        if self.refuse.contains(ctx.node().id().as_str()) {
            return Ok(None);
        }

        Ok(Some(ctx.object(String::from("placeholder"))))
    }

    fn populate(&self, ctx: &CreateContext<'_>, placeholder: Object) -> anyhow::Result<Option<Object>> {
        self.log("populate", ctx);
        let node = ctx.node().id().as_str();

        if let Some((held, gate)) = &self.gate {
            if held == node {
                gate.enter(node);
            }
        }

        if self.panic_on.contains(node) {
            panic!("factory exploded on {node}");
        }

        if self.fail_populate.contains(node) {
            bail!("corrupt data in {node}");
        }

        if self.empty_populate.contains(node) {
            return Ok(None);
        }

        Ok(Some(placeholder.with_payload(String::from("populated"))))
    }

    fn can_run_on_any_thread(&self) -> bool {
        self.any_thread
    }

    fn finish(&self, object: &Object) -> anyhow::Result<()> {
        self.finished.lock().unwrap().push(object.origin().to_string());

        if self.fail_finish.contains(object.origin().as_str()) {
            bail!("cannot finish {}", object.origin());
        }
        Ok(())
    }

    fn discard(&self, object: &Object) {
        self.discarded.lock().unwrap().push(object.origin().to_string());
    }
}

type GraphFn = dyn Fn(&mut NodeGraph) + Send + Sync;

/// A pipeline recording where it ran.
pub(crate) struct TestPipeline {
    name: String,
    pre: Option<Box<GraphFn>>,
    post: bool,
    failing: bool,
    pub events: Mutex<Vec<(String, Option<String>)>>,
}

impl TestPipeline {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            pre: None,
            post: false,
            failing: false,
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn on_pre<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut NodeGraph) + Send + Sync + 'static,
    {
        self.pre = Some(Box::new(f));
        self
    }

    pub fn with_post(mut self) -> Self {
        self.post = true;
        self
    }

    /// Makes both the pre and the post step return an error, after
    /// recording the event.
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    /// `(event, thread name)` pairs, event being `pre:<source>` or
    /// `post:<node>`.
    pub fn events(&self) -> Vec<(String, Option<String>)> {
        self.events.lock().unwrap().clone()
    }

    fn log(&self, event: String) {
        let thread = std::thread::current().name().map(String::from);
        self.events.lock().unwrap().push((event, thread));
    }
}

impl Pipeline for TestPipeline {
    fn name(&self) -> &str {
        &self.name
    }

    fn pre_import(&self, graph: &mut NodeGraph, source: &SourceHandle) -> anyhow::Result<()> {
        self.log(format!("pre:{source}"));
        if let Some(pre) = &self.pre {
            pre(graph);
        }

        if self.failing {
            bail!("{} refused {source}", self.name);
        }
        Ok(())
    }

    fn post_import(&self, graph: &mut NodeGraph, node: &NodeId, object: &Object) -> anyhow::Result<()> {
        assert!(graph.get(node).is_some_and(|n| n.reference().is_some()));
        assert_eq!(object.origin(), node);
        self.log(format!("post:{node}"));

        if self.failing {
            bail!("{} refused {node}", self.name);
        }
        Ok(())
    }

    fn has_post_import(&self) -> bool {
        self.post
    }
}

/// Serves a fixed graph for every source matching `pattern`.
pub(crate) fn serve(pattern: &str, graph: NodeGraph) -> Arc<FnTranslator> {
    let translator = FnTranslator::new(format!("serve {pattern}"), &[pattern], move |_| Ok(graph.clone()));
    Arc::new(translator.unwrap())
}

/// Holds every translation at the gate before serving the graph.
pub(crate) fn serve_gated(pattern: &str, graph: NodeGraph, gate: Gate) -> Arc<FnTranslator> {
    let translator = FnTranslator::new(format!("gated {pattern}"), &[pattern], move |source| {
        gate.enter(source.path().as_str());
        Ok(graph.clone())
    });
    Arc::new(translator.unwrap())
}

/// Accepts sources matching `pattern`, fails to read every one of them.
pub(crate) fn serve_broken(pattern: &str) -> Arc<FnTranslator> {
    let translator = FnTranslator::new(format!("broken {pattern}"), &[pattern], |source| {
        Err(anyhow!("unexpected end of file in {source}"))
    });
    Arc::new(translator.unwrap())
}

/// An in-memory store refusing to allocate or publish chosen containers.
#[derive(Default)]
pub(crate) struct FlakyContainers {
    pub inner: MemoryContainers,
    refuse_allocate: HashSet<String>,
    refuse_publish: HashSet<String>,
}

impl FlakyContainers {
    pub fn refuse_allocate(mut self, path: &str) -> Self {
        self.refuse_allocate.insert(path.to_string());
        self
    }

    pub fn refuse_publish(mut self, path: &str) -> Self {
        self.refuse_publish.insert(path.to_string());
        self
    }
}

impl Containers for FlakyContainers {
    fn collision(&self, path: &str) -> Option<String> {
        self.inner.collision(path)
    }

    fn allocate(&self, path: &str) -> anyhow::Result<()> {
        if self.refuse_allocate.contains(path) {
            bail!("disk quota exceeded for {path}");
        }
        self.inner.allocate(path)
    }

    fn publish(&self, path: &str) -> anyhow::Result<()> {
        if self.refuse_publish.contains(path) {
            bail!("{path} is read-only");
        }
        self.inner.publish(path)
    }

    fn discard(&self, path: &str) {
        self.inner.discard(path)
    }
}

/// A fresh manager without progress bars.
pub(crate) fn manager(workers: usize, budget: Option<usize>) -> ImportManager {
    let mut config = ImportConfig::default().with_workers(workers);
    config.max_active_sessions = budget;
    config.progress = false;
    ImportManager::new(config).unwrap()
}

pub(crate) fn names(objects: &[Object]) -> Vec<String> {
    let mut list: Vec<String> = objects.iter().map(|o| o.origin().to_string()).collect();
    list.sort();
    list
}
