//! Lazily computed properties invalidated by their declared inputs.
//!
//! Every component declares its properties as a static dependency graph.
//! Writing an input marks all the transitive dependents stale and evicts
//! their cached values, so the owner can release the resources held by them.
//! Reading a stale property recomputes it from its dependencies on demand.

pub mod owned;
pub mod resources;

pub use owned::OwnedBuffers;
pub use resources::{Resource, ResourceTable};

use std::fmt;

/// A node of the dependency graph.
///
/// Inputs have no dependencies.
pub trait Property: Copy + fmt::Debug + 'static {
    /// Every property, ordered by [`Property::index`].
    const ALL: &'static [Self];

    fn index(self) -> usize;

    fn dependencies(self) -> &'static [Self];

    #[inline]
    fn is_input(self) -> bool {
        self.dependencies().is_empty()
    }
}

/// The dependency graph of `P`.
#[derive(Clone)]
pub struct Graph<P: Property> {
    nodes: Vec<Node<P>>,
}

#[derive(Clone)]
struct Node<P> {
    property: P,
    is_dirty: bool,
    /// Indexes of the nodes reading this node.
    dependents: Vec<usize>,
}

impl<P: Property> Graph<P> {
    /// Building the graph with every derived property stale.
    pub fn new() -> Self {
        let mut nodes = P::ALL
            .iter()
            .map(|&property| Node {
                property,
                is_dirty: !property.is_input(),
                dependents: vec![],
            })
            .collect::<Vec<_>>();

        for property in P::ALL {
            for dependency in property.dependencies() {
                nodes[dependency.index()].dependents.push(property.index());
            }
        }

        Self { nodes }
    }

    #[inline]
    pub fn is_dirty(
        &self,
        property: P,
    ) -> bool {
        self.nodes[property.index()].is_dirty
    }

    #[inline]
    pub fn mark_clean(
        &mut self,
        property: P,
    ) {
        self.nodes[property.index()].is_dirty = false;
    }

    /// Marking every transitive dependent of `property` stale.
    ///
    /// It returns the dependents which were fresh before.
    pub fn invalidate(
        &mut self,
        property: P,
    ) -> Vec<P> {
        let mut is_visited = vec![false; self.nodes.len()];
        let mut stack = self.nodes[property.index()].dependents.to_owned();
        let mut invalidated = vec![];

        while let Some(index) = stack.pop() {
            if is_visited[index] {
                continue;
            }
            is_visited[index] = true;

            let node = &mut self.nodes[index];
            if !node.is_dirty {
                node.is_dirty = true;
                invalidated.push(node.property);
            }
            stack.extend_from_slice(&node.dependents);
        }

        invalidated
    }

    /// Marking every derived property stale.
    pub fn invalidate_all(&mut self) -> Vec<P> {
        self.nodes
            .iter_mut()
            .filter(|node| !node.property.is_input() && !node.is_dirty)
            .map(|node| {
                node.is_dirty = true;
                node.property
            })
            .collect()
    }
}

impl<P: Property> Default for Graph<P> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Property> fmt::Debug for Graph<P> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        f.debug_map()
            .entries(
                self.nodes
                    .iter()
                    .map(|node| (node.property, node.is_dirty)),
            )
            .finish()
    }
}

/// Cached values of the derived properties in `P`.
///
/// It is the arena of one component's derived resources, keyed by property.
pub struct Cells<P: Property, V> {
    graph: Graph<P>,
    values: Vec<Option<V>>,
}

impl<P: Property, V> Cells<P, V> {
    pub fn new() -> Self {
        Self {
            graph: Graph::new(),
            values: P::ALL.iter().map(|_| None).collect(),
        }
    }

    /// The cached value if it is fresh.
    #[inline]
    pub fn get(
        &self,
        property: P,
    ) -> Option<&V> {
        if self.graph.is_dirty(property) {
            return None;
        }
        self.values[property.index()].as_ref()
    }

    /// Caching the fresh value.
    ///
    /// It returns the stale value replaced by it.
    pub fn set(
        &mut self,
        property: P,
        value: V,
    ) -> Option<V> {
        self.graph.mark_clean(property);
        self.values[property.index()].replace(value)
    }

    /// Invalidating the dependents of the input.
    ///
    /// It returns the evicted values of them.
    pub fn invalidate(
        &mut self,
        input: P,
    ) -> Vec<V> {
        self.graph.invalidate(input);
        self.evict_dirty()
    }

    /// Invalidating every derived property.
    ///
    /// It returns the evicted values.
    pub fn clear(&mut self) -> Vec<V> {
        self.graph.invalidate_all();
        self.evict_dirty()
    }

    #[inline]
    pub fn graph(&self) -> &Graph<P> {
        &self.graph
    }

    fn evict_dirty(&mut self) -> Vec<V> {
        let graph = &self.graph;
        P::ALL
            .iter()
            .filter(|&&property| graph.is_dirty(property))
            .filter_map(|property| self.values[property.index()].take())
            .collect()
    }
}

impl<P: Property, V> Default for Cells<P, V> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Property, V: fmt::Debug> fmt::Debug for Cells<P, V> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        f.debug_map()
            .entries(P::ALL.iter().filter_map(|&property| {
                self.get(property).map(|value| (property, value))
            }))
            .finish()
    }
}
