//! Component registry.
//!
//! Maps the `implementation` key of a component entry to a factory that
//! turns the resolved [`ComponentSpec`] into a typed trait object. Every
//! factory runs once, at startup, in [`ComponentRegistry::build`].
//!
//! # Example
//!
//! ```rust
//! use mobility_harvester::registry::ComponentRegistry;
//! use mobility_harvester_core::component::Role;
//!
//! let registry = ComponentRegistry::with_builtins();
//! assert!(registry.find(Role::Harvester, "trajectory").is_some());
//! // registry.register(Role::Collector, "ftp", Box::new(|spec| ...));
//! ```

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

use mobility_harvester_core::component::{Component, Role};
use mobility_harvester_core::graph::ComponentGraph;

use crate::config::ComponentSpec;
use crate::pipeline::Pipeline;

/// Builds one component from its resolved declaration.
pub type Factory = Box<dyn Fn(&ComponentSpec) -> Result<Component> + Send + Sync>;

/// Registry of component factories, keyed by role and implementation name.
pub struct ComponentRegistry {
    factories: BTreeMap<(Role, String), Factory>,
}

impl ComponentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Create a registry pre-loaded with the built-in implementations:
    /// the `http` collector, the `trajectory` and `concat` harvesters and
    /// the `range` and `trips` handlers.
    pub fn with_builtins() -> Self {
        use crate::collector_http::HttpCollector;
        use crate::handler_range::RangeHandler;
        use crate::handler_trips::TripsHandler;
        use crate::harvester_concat::ConcatHarvester;
        use crate::harvester_trajectory::TrajectoryHarvester;

        let mut registry = Self::new();
        registry.register(
            Role::Collector,
            "http",
            Box::new(|spec| Ok(Component::Collector(Arc::new(HttpCollector::from_spec(spec)?)))),
        );
        registry.register(
            Role::Harvester,
            "trajectory",
            Box::new(|spec| {
                Ok(Component::Harvester(Arc::new(
                    TrajectoryHarvester::from_spec(spec)?,
                )))
            }),
        );
        registry.register(
            Role::Harvester,
            "concat",
            Box::new(|spec| {
                Ok(Component::Harvester(Arc::new(
                    ConcatHarvester::from_spec(spec)?,
                )))
            }),
        );
        registry.register(
            Role::Handler,
            "range",
            Box::new(|spec| Ok(Component::Handler(Arc::new(RangeHandler::from_spec(spec)?)))),
        );
        registry.register(
            Role::Handler,
            "trips",
            Box::new(|spec| Ok(Component::Handler(Arc::new(TripsHandler::from_spec(spec)?)))),
        );
        registry
    }

    /// Register a factory. A later registration replaces an earlier one.
    pub fn register(&mut self, role: Role, implementation: &str, factory: Factory) {
        self.factories
            .insert((role, implementation.to_string()), factory);
    }

    /// Find the factory for an implementation.
    pub fn find(&self, role: Role, implementation: &str) -> Option<&Factory> {
        self.factories.get(&(role, implementation.to_string()))
    }

    /// Implementation names registered for a role, sorted.
    pub fn implementations(&self, role: Role) -> Vec<&str> {
        self.factories
            .keys()
            .filter(|(r, _)| *r == role)
            .map(|(_, name)| name.as_str())
            .collect()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Return the count of registered factories.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Resolve the component graph and build every component.
    ///
    /// Fails on duplicate names, unknown references, unknown
    /// implementations, and factories that reject their settings.
    pub fn build(&self, specs: Vec<ComponentSpec>) -> Result<Pipeline> {
        let graph = ComponentGraph::build(specs.iter().map(ComponentSpec::node_decl))?;

        let mut components = Vec::with_capacity(specs.len());
        for spec in &specs {
            let factory = self.find(spec.role, &spec.implementation).with_context(|| {
                format!(
                    "Unknown {} implementation '{}' for '{}' (known: {})",
                    spec.role,
                    spec.implementation,
                    spec.name,
                    self.implementations(spec.role).join(", ")
                )
            })?;
            let component =
                factory(spec).with_context(|| format!("Failed to build '{}'", spec.name))?;
            if component.role() != spec.role {
                bail!(
                    "Implementation '{}' built a {} for {} '{}'",
                    spec.implementation,
                    component.role(),
                    spec.role,
                    spec.name
                );
            }
            components.push(component);
        }

        Ok(Pipeline::new(graph, specs, components))
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}
