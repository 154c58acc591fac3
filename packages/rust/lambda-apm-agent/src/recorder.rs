//! Per-invocation span storage.
//!
//! The recorder owns two views of the same spans. The flat list is appended
//! on first finish, so it reads in finish order; span aggregates that want
//! "order of completion" iterate it directly. The tree is built at creation
//! time by attaching each span under its parent, so its shape never depends
//! on which span finished first. A span whose parent is unknown starts a new
//! root rather than being dropped.

use crate::span::Span;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Snapshot view of one span and its children, in creation order.
#[derive(Debug, Clone)]
pub struct SpanTreeNode {
    pub span: Arc<Span>,
    pub children: Vec<SpanTreeNode>,
}

struct Node {
    span: Arc<Span>,
    children: Vec<Uuid>,
}

#[derive(Default)]
struct RecorderInner {
    finish_order: Vec<Arc<Span>>,
    nodes: HashMap<Uuid, Node>,
    roots: Vec<Uuid>,
}

/// Span store for a single execution context.
#[derive(Default)]
pub struct Recorder {
    inner: Mutex<RecorderInner>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly created span, attaching it under its parent.
    pub(crate) fn register(&self, span: &Arc<Span>) {
        let Ok(mut guard) = self.inner.lock() else {
            return;
        };
        let inner = &mut *guard;
        let span_id = span.context().span_id();
        if inner.nodes.contains_key(&span_id) {
            return;
        }
        inner.nodes.insert(
            span_id,
            Node {
                span: span.clone(),
                children: Vec::new(),
            },
        );
        let parent = span
            .context()
            .parent_span_id()
            .and_then(|parent_id| inner.nodes.get_mut(&parent_id));
        match parent {
            Some(node) => node.children.push(span_id),
            None => inner.roots.push(span_id),
        }
    }

    /// Record a first finish. Appends to the flat list; the tree is untouched.
    pub(crate) fn record_finish(&self, span: &Arc<Span>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.finish_order.push(span.clone());
        }
    }

    /// Spans in the order they finished. Unfinished spans do not appear.
    pub fn span_list(&self) -> Vec<Arc<Span>> {
        self.inner
            .lock()
            .map(|inner| inner.finish_order.clone())
            .unwrap_or_default()
    }

    /// Look up a registered span by id.
    pub fn find(&self, span_id: Uuid) -> Option<Arc<Span>> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.nodes.get(&span_id).map(|n| n.span.clone()))
    }

    /// Number of registered spans, finished or not.
    pub fn span_count(&self) -> usize {
        self.inner.lock().map(|inner| inner.nodes.len()).unwrap_or(0)
    }

    /// Materialize the creation-time tree, one node per root.
    pub fn span_tree(&self) -> Vec<SpanTreeNode> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        inner
            .roots
            .iter()
            .filter_map(|root| build_node(&inner, *root))
            .collect()
    }

    /// Materialize the subtree rooted at the given span.
    pub fn span_tree_from(&self, root_id: Uuid) -> Option<SpanTreeNode> {
        let inner = self.inner.lock().ok()?;
        build_node(&inner, root_id)
    }

    /// Drop every stored span. Called when the owning context is reported.
    pub fn destroy(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.finish_order.clear();
            inner.nodes.clear();
            inner.roots.clear();
        }
    }
}

fn build_node(inner: &RecorderInner, span_id: Uuid) -> Option<SpanTreeNode> {
    let node = inner.nodes.get(&span_id)?;
    Some(SpanTreeNode {
        span: node.span.clone(),
        children: node
            .children
            .iter()
            .filter_map(|child| build_node(inner, *child))
            .collect(),
    })
}
