//! The built component set and selection of what to run.
//!
//! A [`Pipeline`] pairs the resolved [`ComponentGraph`] with the typed
//! component built for every node. Nodes, specs and components share one
//! index space, so a [`NodeId`] addresses all three.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::sync::Arc;

use mobility_harvester_core::component::{Collector, Component, Handler, Harvester, Role};
use mobility_harvester_core::graph::{ComponentGraph, NodeId};

use crate::config::ComponentSpec;

pub struct Pipeline {
    graph: ComponentGraph,
    specs: Vec<ComponentSpec>,
    components: Vec<Component>,
}

impl Pipeline {
    pub(crate) fn new(
        graph: ComponentGraph,
        specs: Vec<ComponentSpec>,
        components: Vec<Component>,
    ) -> Self {
        Self {
            graph,
            specs,
            components,
        }
    }

    pub fn graph(&self) -> &ComponentGraph {
        &self.graph
    }

    pub fn spec(&self, id: NodeId) -> &ComponentSpec {
        &self.specs[id.0]
    }

    pub fn component(&self, id: NodeId) -> &Component {
        &self.components[id.0]
    }

    pub fn specs(&self) -> &[ComponentSpec] {
        &self.specs
    }

    pub fn find(&self, name: &str) -> Option<NodeId> {
        self.graph.id_of(name)
    }

    /// Every node of a role, in declaration order.
    pub fn ids(&self, role: Role) -> Vec<NodeId> {
        self.graph.with_role(role).map(|(id, _)| id).collect()
    }

    pub fn collector(&self, id: NodeId) -> Option<Arc<dyn Collector>> {
        match self.component(id) {
            Component::Collector(c) => Some(Arc::clone(c)),
            _ => None,
        }
    }

    pub fn harvester(&self, id: NodeId) -> Option<Arc<dyn Harvester>> {
        match self.component(id) {
            Component::Harvester(h) => Some(Arc::clone(h)),
            _ => None,
        }
    }

    pub fn handler(&self, id: NodeId) -> Option<Arc<dyn Handler>> {
        match self.component(id) {
            Component::Handler(h) => Some(Arc::clone(h)),
            _ => None,
        }
    }

    /// Resolve a selection against the nodes of one role.
    pub fn select(&self, role: Role, selection: &Selection) -> Result<Vec<NodeId>> {
        let candidates = self.ids(role);
        match selection {
            Selection::None => Ok(Vec::new()),
            Selection::All => Ok(candidates),
            Selection::Patterns { literals, globs } => {
                for literal in literals {
                    let known = candidates
                        .iter()
                        .any(|id| &self.spec(*id).name == literal);
                    if !known {
                        bail!("No {} named '{}'", role, literal);
                    }
                }
                Ok(candidates
                    .into_iter()
                    .filter(|id| {
                        let name = &self.spec(*id).name;
                        literals.contains(name) || globs.is_match(name)
                    })
                    .collect())
            }
        }
    }
}

/// Which components of one role the CLI asked for.
#[derive(Debug, Clone)]
pub enum Selection {
    None,
    All,
    /// Exact names must exist; glob patterns may match nothing.
    Patterns { literals: Vec<String>, globs: GlobSet },
}

impl Selection {
    /// Parse CLI values: names, `all`, `*`, or glob patterns. Dotted
    /// names (`file.n`) are accepted for `file_n`.
    pub fn parse(values: &[String]) -> Result<Self> {
        if values.is_empty() {
            return Ok(Selection::None);
        }
        if values.iter().any(|v| v == "all" || v == "*") {
            return Ok(Selection::All);
        }

        let mut literals = Vec::new();
        let mut builder = GlobSetBuilder::new();
        for value in values {
            let value = value.replace('.', "_");
            if value.contains(|c: char| matches!(c, '*' | '?' | '[' | '{')) {
                builder.add(Glob::new(&value)?);
            } else {
                literals.push(value);
            }
        }
        Ok(Selection::Patterns {
            literals,
            globs: builder.build()?,
        })
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Selection::None)
    }
}
