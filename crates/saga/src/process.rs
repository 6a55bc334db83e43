//! Saga process graph.
//!
//! A [`Process`] is the static template of a saga: a tree of coded steps,
//! each with a forward handler and an optional compensating handler. A node
//! may have ordered sub-nodes (run depth-first before anything that follows
//! the node) and one `next` node (sequential continuation). The graph is built
//! once at start-up and never persisted; only progress against it is.
//!
//! Graphs are built either fluently:
//!
//! ```ignore
//! let process = Process::of(100, "reserve", reserve)
//!     .with_rollback(release)
//!     .then(Process::of(110, "charge", charge).with_rollback(refund))
//!     .then(Process::of(120, "ship", ship));
//! ```
//!
//! or from a flat list of [`StepDeclaration`]s linked by parent/preceding
//! step names.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use common::HandlerError;
use futures_util::future::{BoxFuture, FutureExt};

use crate::{Result, SagaError};

/// Spacing between auto-assigned step codes.
pub const CODE_STEP: i32 = 10;

/// Forward handler: takes the running context, returns the updated context.
pub type ForwardFn<C> =
    Arc<dyn Fn(C) -> BoxFuture<'static, std::result::Result<C, HandlerError>> + Send + Sync>;

/// Compensating handler. `Ok(false)` means the compensation did not take
/// effect and must be retried.
pub type CompensateFn<C> = Arc<
    dyn Fn(Compensation<C>) -> BoxFuture<'static, std::result::Result<bool, HandlerError>>
        + Send
        + Sync,
>;

/// What a compensating handler gets to work with.
#[derive(Debug, Clone)]
pub struct Compensation<C> {
    /// Context the forward handler was called with.
    pub input: Option<C>,
    /// Context the forward handler returned. `None` if it never completed.
    pub output: Option<C>,
    /// Latest saga context.
    pub context: C,
}

/// One node of a saga process graph, owning its sub-nodes and continuation.
pub struct Process<C> {
    code: i32,
    name: String,
    forward: ForwardFn<C>,
    compensate: Option<CompensateFn<C>>,
    subs: Vec<Process<C>>,
    next: Option<Box<Process<C>>>,
}

impl<C: Send + 'static> Process<C> {
    /// A leaf node. A `code` of 0 renumbers the node and everything attached
    /// to it when it is passed to [`then`](Self::then) or
    /// [`add_sub`](Self::add_sub).
    pub fn of<F, Fut>(code: i32, name: impl Into<String>, forward: F) -> Self
    where
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<C, HandlerError>> + Send + 'static,
    {
        Self {
            code,
            name: name.into(),
            forward: Arc::new(move |ctx| forward(ctx).boxed()),
            compensate: None,
            subs: Vec::new(),
            next: None,
        }
    }

    /// Sets the compensating handler.
    pub fn with_rollback<F, Fut>(mut self, compensate: F) -> Self
    where
        F: Fn(Compensation<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<bool, HandlerError>> + Send + 'static,
    {
        self.compensate = Some(Arc::new(move |c| compensate(c).boxed()));
        self
    }

    /// Adds `sub` (and its own subtree) to this node's sub-nodes, which stay
    /// ordered by `(code, name)` whatever the insertion order.
    pub fn add_sub(mut self, mut sub: Process<C>) -> Self {
        self.assign_codes(&mut sub);
        let at = self
            .subs
            .partition_point(|s| (s.code, s.name.as_str()) <= (sub.code, sub.name.as_str()));
        self.subs.insert(at, sub);
        self
    }

    /// Appends `next` at the end of this node's continuation chain.
    ///
    /// Returns the head of the chain, so calls compose left to right. To give
    /// a later node sub-nodes, build that node first and pass it in.
    pub fn then(mut self, mut next: Process<C>) -> Self {
        self.assign_codes(&mut next);
        self.append(next);
        self
    }

    fn append(&mut self, next: Process<C>) {
        if let Some(tail) = self.next.as_mut() {
            tail.append(next);
        } else {
            self.next = Some(Box::new(next));
        }
    }

    /// Renumbers an uncoded subtree after this graph's highest code.
    fn assign_codes(&self, incoming: &mut Process<C>) {
        if incoming.code != 0 {
            return;
        }
        let mut code = self.max_code() + CODE_STEP;
        incoming.visit_mut(&mut |p| {
            p.code = code;
            code += CODE_STEP;
        });
    }

    fn visit_mut(&mut self, f: &mut dyn FnMut(&mut Process<C>)) {
        f(self);
        for sub in &mut self.subs {
            sub.visit_mut(f);
        }
        if let Some(next) = self.next.as_mut() {
            next.visit_mut(f);
        }
    }

    /// Builds a graph from declarations linked by step name.
    ///
    /// A declaration with neither parent nor predecessor is a root. Sub-nodes
    /// and roots are ordered by `(code, name)`. Several roots are chained as
    /// sub-nodes of the first one.
    pub fn from_declarations(declarations: Vec<StepDeclaration<C>>) -> Result<Self> {
        let mut links = Vec::with_capacity(declarations.len());
        let mut pool = HashMap::with_capacity(declarations.len());
        for declaration in declarations {
            let link = Link {
                code: declaration.process.code,
                name: declaration.process.name.clone(),
                parent: declaration.parent,
                preceding: declaration.preceding,
            };
            if pool.insert(link.name.clone(), declaration.process).is_some() {
                return Err(SagaError::InvalidGraph(format!(
                    "step '{}' declared twice",
                    link.name
                )));
            }
            links.push(link);
        }
        links.sort_by(|a, b| (a.code, &a.name).cmp(&(b.code, &b.name)));

        let roots: Vec<&Link> = links
            .iter()
            .filter(|l| l.parent.is_none() && l.preceding.is_none())
            .collect();
        let Some((first, rest)) = roots.split_first() else {
            return Err(SagaError::InvalidGraph("no root step declared".to_string()));
        };

        let mut root = assemble(&first.name, &links, &mut pool)?;
        for other in rest {
            let sub = assemble(&other.name, &links, &mut pool)?;
            root = root.add_sub(sub);
        }

        if !pool.is_empty() {
            let mut orphans: Vec<_> = pool.into_keys().collect();
            orphans.sort();
            return Err(SagaError::InvalidGraph(format!(
                "steps not reachable from a root: {}",
                orphans.join(", ")
            )));
        }

        root.validate()?;
        Ok(root)
    }
}

impl<C> Process<C> {
    pub fn code(&self) -> i32 {
        self.code
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_rollback(&self) -> bool {
        self.compensate.is_some()
    }

    pub fn subs(&self) -> &[Process<C>] {
        &self.subs
    }

    pub fn next(&self) -> Option<&Process<C>> {
        self.next.as_deref()
    }

    pub(crate) fn forward(&self) -> &ForwardFn<C> {
        &self.forward
    }

    pub(crate) fn compensate(&self) -> Option<&CompensateFn<C>> {
        self.compensate.as_ref()
    }

    /// Nodes in forward execution order: the node, each sub-node's subtree in
    /// order, then the continuation.
    ///
    /// Compensation walks this list backwards.
    pub fn flatten(&self) -> Vec<&Process<C>> {
        let mut nodes = Vec::new();
        self.collect(&mut nodes);
        nodes
    }

    fn collect<'a>(&'a self, nodes: &mut Vec<&'a Process<C>>) {
        nodes.push(self);
        for sub in &self.subs {
            sub.collect(nodes);
        }
        if let Some(next) = self.next.as_deref() {
            next.collect(nodes);
        }
    }

    pub fn max_code(&self) -> i32 {
        self.flatten()
            .iter()
            .map(|p| p.code)
            .max()
            .unwrap_or(self.code)
    }

    /// Checks that step codes are unique within the graph.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for node in self.flatten() {
            if !seen.insert(node.code) {
                return Err(SagaError::InvalidGraph(format!(
                    "duplicate step code {} ('{}')",
                    node.code, node.name
                )));
            }
        }
        Ok(())
    }
}

impl<C> fmt::Debug for Process<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("code", &self.code)
            .field("name", &self.name)
            .field("has_rollback", &self.has_rollback())
            .field("subs", &self.subs)
            .field("next", &self.next)
            .finish()
    }
}

/// A step plus the name of the step it hangs under or follows.
pub struct StepDeclaration<C> {
    process: Process<C>,
    parent: Option<String>,
    preceding: Option<String>,
}

impl<C> StepDeclaration<C> {
    pub fn new(process: Process<C>) -> Self {
        Self {
            process,
            parent: None,
            preceding: None,
        }
    }

    /// Declares this step a sub-node of `parent`.
    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Declares this step the continuation of `preceding`.
    pub fn after(mut self, preceding: impl Into<String>) -> Self {
        self.preceding = Some(preceding.into());
        self
    }
}

struct Link {
    code: i32,
    name: String,
    parent: Option<String>,
    preceding: Option<String>,
}

fn assemble<C: Send + 'static>(
    name: &str,
    links: &[Link],
    pool: &mut HashMap<String, Process<C>>,
) -> Result<Process<C>> {
    let mut process = pool.remove(name).ok_or_else(|| {
        SagaError::InvalidGraph(format!("step '{name}' is linked from more than one place"))
    })?;

    // `links` is sorted, so sub-nodes come out in (code, name) order.
    for child in links.iter().filter(|l| l.parent.as_deref() == Some(name)) {
        let sub = assemble(&child.name, links, pool)?;
        process = process.add_sub(sub);
    }

    let mut followers = links
        .iter()
        .filter(|l| l.preceding.as_deref() == Some(name));
    if let Some(follower) = followers.next() {
        if let Some(other) = followers.next() {
            return Err(SagaError::InvalidGraph(format!(
                "steps '{}' and '{}' both follow '{name}'",
                follower.name, other.name
            )));
        }
        let next = assemble(&follower.name, links, pool)?;
        process = process.then(next);
    }

    Ok(process)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(code: i32, name: &str) -> Process<u32> {
        Process::of(code, name, |ctx: u32| async move { Ok(ctx + 1) })
    }

    fn codes(process: &Process<u32>) -> Vec<i32> {
        process.flatten().iter().map(|p| p.code()).collect()
    }

    #[test]
    fn test_then_chains_in_order() {
        let process = step(100, "reserve")
            .then(step(110, "charge"))
            .then(step(120, "ship"));
        assert_eq!(codes(&process), vec![100, 110, 120]);
        assert_eq!(process.next().unwrap().name(), "charge");
        process.validate().unwrap();
    }

    #[test]
    fn test_zero_codes_are_assigned_in_steps_of_ten() {
        let process = step(0, "a").then(step(0, "b")).add_sub(step(0, "c"));
        assert_eq!(codes(&process), vec![0, 20, 10]);

        let process = step(100, "a").then(step(0, "b").then(step(0, "c")));
        assert_eq!(codes(&process), vec![100, 110, 120]);
    }

    #[test]
    fn test_subs_are_ordered_by_code_then_name() {
        let process = step(100, "a")
            .add_sub(step(120, "c"))
            .add_sub(step(110, "b"))
            .add_sub(step(110, "a2"));
        assert_eq!(codes(&process), vec![100, 110, 110, 120]);
        let names: Vec<_> = process.subs().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["a2", "b", "c"]);
    }

    #[test]
    fn test_flatten_visits_subs_before_next() {
        let process = step(100, "a")
            .add_sub(step(110, "b").add_sub(step(115, "b1")))
            .add_sub(step(120, "c"))
            .then(step(130, "d"));
        assert_eq!(codes(&process), vec![100, 110, 115, 120, 130]);
    }

    #[test]
    fn test_duplicate_codes_are_rejected() {
        let process = step(100, "a").then(step(100, "b"));
        assert!(matches!(process.validate(), Err(SagaError::InvalidGraph(_))));
    }

    #[tokio::test]
    async fn test_handlers_are_callable() {
        let process = step(100, "a").with_rollback(|c: Compensation<u32>| async move {
            Ok(c.output == Some(2))
        });
        assert_eq!((process.forward())(1).await.unwrap(), 2);

        let compensate = process.compensate().unwrap();
        let done = compensate(Compensation {
            input: Some(1),
            output: Some(2),
            context: 2,
        })
        .await
        .unwrap();
        assert!(done);
    }

    #[test]
    fn test_declarations_link_by_name() {
        let process = Process::from_declarations(vec![
            StepDeclaration::new(step(120, "ship")).after("charge"),
            StepDeclaration::new(step(110, "charge")).after("reserve"),
            StepDeclaration::new(step(105, "notify")).parent("reserve"),
            StepDeclaration::new(step(100, "reserve")),
        ])
        .unwrap();
        assert_eq!(codes(&process), vec![100, 105, 110, 120]);
        assert_eq!(process.subs()[0].name(), "notify");
    }

    #[test]
    fn test_declared_subs_sort_by_code_then_name() {
        let process = Process::from_declarations(vec![
            StepDeclaration::new(step(100, "root")),
            StepDeclaration::new(step(110, "zeta")).parent("root"),
            StepDeclaration::new(step(110, "alpha")).parent("root"),
            StepDeclaration::new(step(105, "omega")).parent("root"),
        ])
        .unwrap();
        let names: Vec<_> = process.subs().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["omega", "alpha", "zeta"]);
    }

    #[test]
    fn test_several_roots_hang_under_the_first() {
        let process = Process::from_declarations(vec![
            StepDeclaration::new(step(200, "second")),
            StepDeclaration::new(step(100, "first")),
        ])
        .unwrap();
        assert_eq!(process.name(), "first");
        assert_eq!(process.subs()[0].name(), "second");
    }

    #[test]
    fn test_declarations_without_root_are_rejected() {
        let result = Process::from_declarations(vec![
            StepDeclaration::new(step(100, "a")).after("b"),
            StepDeclaration::new(step(110, "b")).after("a"),
        ]);
        assert!(matches!(result, Err(SagaError::InvalidGraph(_))));

        let result = Process::<u32>::from_declarations(Vec::new());
        assert!(matches!(result, Err(SagaError::InvalidGraph(_))));
    }

    #[test]
    fn test_cycle_off_the_root_is_rejected() {
        let result = Process::from_declarations(vec![
            StepDeclaration::new(step(100, "root")),
            StepDeclaration::new(step(110, "a")).after("b"),
            StepDeclaration::new(step(120, "b")).after("a"),
        ]);
        let Err(SagaError::InvalidGraph(message)) = result else {
            panic!("expected an invalid graph");
        };
        assert!(message.contains("a, b"));
    }

    #[test]
    fn test_two_followers_are_rejected() {
        let result = Process::from_declarations(vec![
            StepDeclaration::new(step(100, "root")),
            StepDeclaration::new(step(110, "a")).after("root"),
            StepDeclaration::new(step(120, "b")).after("root"),
        ]);
        assert!(matches!(result, Err(SagaError::InvalidGraph(_))));
    }
}
