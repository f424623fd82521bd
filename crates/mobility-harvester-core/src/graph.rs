//! The component graph: an arena of nodes with index-based edges.
//!
//! Every configured component becomes one [`GraphNode`]. Its `source` and
//! `dependencies` are resolved to [`NodeId`]s once, when the graph is
//! built, so unknown references are reported at load time and the
//! bootstrap ordering is a plain scan over vectors.

use std::collections::HashMap;

use thiserror::Error;

use crate::component::Role;

/// Index of a node in its [`ComponentGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("component '{0}' is declared twice")]
    DuplicateName(String),
    #[error("component '{component}' references unknown component '{reference}'")]
    UnknownReference { component: String, reference: String },
}

/// A component as declared, before references are resolved.
#[derive(Debug, Clone)]
pub struct NodeDecl {
    pub name: String,
    pub role: Role,
    pub source: Option<String>,
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub name: String,
    pub role: Role,
    pub source: Option<NodeId>,
    pub dependencies: Vec<NodeId>,
}

impl GraphNode {
    /// The source followed by every dependency, in declaration order.
    pub fn prerequisites(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.dependencies.iter().copied().chain(self.source)
    }
}

/// Result of [`ComponentGraph::bootstrap_order`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapOrder {
    /// Every harvester, ordered so prerequisites come first where possible.
    pub order: Vec<NodeId>,
    /// Harvesters that could not be placed after their prerequisites
    /// (cycles). They are also present at the end of `order`.
    pub unresolved: Vec<NodeId>,
}

/// Upper bound on resolver scans, whatever the graph looks like.
const MAX_RESOLVER_ITERATIONS: usize = 10_000;

#[derive(Debug, Clone, Default)]
pub struct ComponentGraph {
    nodes: Vec<GraphNode>,
    by_name: HashMap<String, NodeId>,
}

impl ComponentGraph {
    /// Build the arena, resolving every reference by name.
    pub fn build(decls: impl IntoIterator<Item = NodeDecl>) -> Result<Self, GraphError> {
        let decls: Vec<NodeDecl> = decls.into_iter().collect();
        let mut by_name = HashMap::with_capacity(decls.len());
        for (idx, decl) in decls.iter().enumerate() {
            if by_name.insert(decl.name.clone(), NodeId(idx)).is_some() {
                return Err(GraphError::DuplicateName(decl.name.clone()));
            }
        }

        let resolve = |component: &str, reference: &str| {
            by_name
                .get(reference)
                .copied()
                .ok_or_else(|| GraphError::UnknownReference {
                    component: component.to_string(),
                    reference: reference.to_string(),
                })
        };

        let mut nodes = Vec::with_capacity(decls.len());
        for decl in &decls {
            let source = decl
                .source
                .as_deref()
                .map(|s| resolve(&decl.name, s))
                .transpose()?;
            let dependencies = decl
                .dependencies
                .iter()
                .map(|d| resolve(&decl.name, d))
                .collect::<Result<Vec<_>, _>>()?;
            nodes.push(GraphNode {
                name: decl.name.clone(),
                role: decl.role,
                source,
                dependencies,
            });
        }

        Ok(Self { nodes, by_name })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &GraphNode {
        &self.nodes[id.0]
    }

    pub fn id_of(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, name: &str) -> Option<&GraphNode> {
        self.id_of(name).map(|id| self.node(id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &GraphNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeId(i), n))
    }

    pub fn with_role(&self, role: Role) -> impl Iterator<Item = (NodeId, &GraphNode)> {
        self.nodes().filter(move |(_, n)| n.role == role)
    }

    /// Best-effort topological order of the harvesters for a catch-up run.
    ///
    /// A prerequisite is satisfied when it is already placed, when it has
    /// no source of its own (collectors, and anything else with nothing
    /// upstream), or when it is the harvester itself. Each scan places the
    /// first harvester whose prerequisites are all satisfied. The loop ends
    /// when every harvester is placed, when a full scan places nothing, or
    /// after [`MAX_RESOLVER_ITERATIONS`]; leftovers are appended in
    /// declaration order and reported as unresolved.
    pub fn bootstrap_order(&self) -> BootstrapOrder {
        let mut pending: Vec<NodeId> = self.with_role(Role::Harvester).map(|(id, _)| id).collect();
        let mut placed = vec![false; self.nodes.len()];
        let mut order = Vec::with_capacity(pending.len());

        for _ in 0..MAX_RESOLVER_ITERATIONS {
            if pending.is_empty() {
                break;
            }
            let ready = pending.iter().position(|&id| {
                self.node(id)
                    .prerequisites()
                    .all(|pre| pre == id || placed[pre.0] || self.node(pre).source.is_none())
            });
            let Some(pos) = ready else {
                break;
            };
            let id = pending.remove(pos);
            placed[id.0] = true;
            order.push(id);
        }

        order.extend(pending.iter().copied());
        BootstrapOrder {
            order,
            unresolved: pending,
        }
    }
}
