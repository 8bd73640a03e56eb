//! Immutable routing graph snapshots
//!
//! A [`RouterGraph`] is never modified after construction. Reconfiguration
//! builds a new graph (reusing unchanged edges) and swaps it in; routing
//! threads holding the old snapshot finish with it undisturbed.

use super::edge::{Edge, EdgeId, EdgeState};
use crate::message::BindingId;
use std::collections::HashMap;
use std::sync::Arc;

/// Set of edges indexed by source binding
#[derive(Debug, Default)]
pub struct RouterGraph {
    edges: Vec<Arc<Edge>>,
    by_source: HashMap<BindingId, Vec<usize>>,
}

impl RouterGraph {
    pub fn new(edges: Vec<Arc<Edge>>) -> Self {
        let mut by_source: HashMap<BindingId, Vec<usize>> = HashMap::new();
        for (i, edge) in edges.iter().enumerate() {
            by_source.entry(edge.from().clone()).or_default().push(i);
        }
        Self { edges, by_source }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Edges whose source is `source`, in declaration order
    pub fn edges_from<'a>(&'a self, source: &BindingId) -> impl Iterator<Item = &'a Arc<Edge>> + 'a {
        self.by_source
            .get(source)
            .into_iter()
            .flat_map(move |indices| indices.iter().map(move |&i| &self.edges[i]))
    }

    pub fn edges(&self) -> &[Arc<Edge>] {
        &self.edges
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Arc<Edge>> {
        self.edges.iter().find(|e| e.id() == id)
    }

    pub fn edge_by_name(&self, name: &str) -> Option<&Arc<Edge>> {
        self.edges.iter().find(|e| e.name() == name)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Number of edges currently Active
    pub fn active_count(&self) -> usize {
        self.edges
            .iter()
            .filter(|e| e.state() == EdgeState::Active)
            .count()
    }

    /// Every binding referenced by an edge
    pub fn referenced_bindings(&self) -> impl Iterator<Item = &BindingId> {
        self.edges
            .iter()
            .flat_map(|e| std::iter::once(e.from()).chain(e.to().iter()))
    }
}
