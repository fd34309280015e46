//! Service dependency graph
//!
//! [`ServiceGraph`] validates a set of declared services and computes the
//! order they are started in. The order is a topological sort of the
//! `depends_on` edges (Kahn's algorithm); whenever several services are ready
//! at once, the one declared first wins, so the same input always yields the
//! same order. Stopping uses the reverse order.

use crate::error::ConfigError;
use schema::Service;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

/// A validated, ordered set of services
#[derive(Debug, Clone)]
pub struct ServiceGraph {
    /// Services in declaration order
    services: Vec<Service>,
    /// Indices into `services` in start order
    order: Vec<usize>,
    /// Service id -> index into `services`
    index: HashMap<String, usize>,
    /// For each service, indices of the services that depend on it
    dependents: Vec<Vec<usize>>,
}

impl ServiceGraph {
    /// Validate the services and compute their start order
    ///
    /// Rejects duplicate ids, references to undeclared services,
    /// self-dependencies and dependency cycles.
    pub fn build(services: Vec<Service>) -> Result<Self, ConfigError> {
        let mut index = HashMap::with_capacity(services.len());
        for (i, svc) in services.iter().enumerate() {
            if index.insert(svc.id.clone(), i).is_some() {
                return Err(ConfigError::DuplicateService(svc.id.clone()));
            }
        }

        // Edges are deduplicated so a repeated dependency counts once
        let mut dependencies: Vec<Vec<usize>> = Vec::with_capacity(services.len());
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); services.len()];
        for (i, svc) in services.iter().enumerate() {
            let mut seen = HashSet::new();
            let mut deps = Vec::new();
            for dep in &svc.depends_on {
                let Some(&d) = index.get(dep) else {
                    return Err(ConfigError::UnknownDependency {
                        service: svc.id.clone(),
                        dependency: dep.clone(),
                    });
                };
                if seen.insert(d) {
                    deps.push(d);
                    dependents[d].push(i);
                }
            }
            dependencies.push(deps);
        }

        let mut unmet: Vec<usize> = dependencies.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..services.len()).filter(|&i| unmet[i] == 0).collect();
        let mut order = Vec::with_capacity(services.len());

        while let Some(next) = ready.pop_first() {
            order.push(next);
            for &dependent in &dependents[next] {
                unmet[dependent] -= 1;
                if unmet[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() < services.len() {
            let offending = cycle_members(&unmet, &dependents)
                .into_iter()
                .map(|i| services[i].id.clone())
                .collect();
            return Err(ConfigError::CycleDetected(offending));
        }

        debug!(
            "Computed start order: {:?}",
            order.iter().map(|&i| services[i].id.as_str()).collect::<Vec<_>>()
        );

        Ok(Self {
            services,
            order,
            index,
            dependents,
        })
    }

    /// Services in start order
    pub fn start_order(&self) -> impl DoubleEndedIterator<Item = &Service> + ExactSizeIterator + '_ {
        self.order.iter().map(move |&i| &self.services[i])
    }

    /// Services in stop order, the reverse of the start order
    pub fn stop_order(&self) -> impl Iterator<Item = &Service> + '_ {
        self.start_order().rev()
    }

    /// Service ids in start order
    pub fn start_ids(&self) -> Vec<String> {
        self.start_order().map(|s| s.id.clone()).collect()
    }

    /// Look up a service by id
    pub fn get(&self, id: &str) -> Option<&Service> {
        self.index.get(id).map(|&i| &self.services[i])
    }

    /// Services in declaration order
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Number of services
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether the graph has no services
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Direct dependencies of a service
    pub fn dependencies_of(&self, id: &str) -> Vec<&Service> {
        self.get(id)
            .map(|svc| {
                svc.depends_on
                    .iter()
                    .filter_map(|dep| self.get(dep))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Direct dependents of a service, in declaration order
    pub fn dependents_of(&self, id: &str) -> Vec<&Service> {
        self.index
            .get(id)
            .map(|&i| self.dependents[i].iter().map(|&d| &self.services[d]).collect())
            .unwrap_or_default()
    }
}

/// Narrow the services Kahn's algorithm could not order down to those on a
/// cycle (or between cycles) by peeling off nodes no remaining node depends on.
fn cycle_members(unmet: &[usize], dependents: &[Vec<usize>]) -> Vec<usize> {
    let mut remaining: BTreeSet<usize> = (0..unmet.len()).filter(|&i| unmet[i] > 0).collect();
    loop {
        let sinks: Vec<usize> = remaining
            .iter()
            .copied()
            .filter(|&i| !dependents[i].iter().any(|d| remaining.contains(d)))
            .collect();
        if sinks.is_empty() {
            break;
        }
        for sink in sinks {
            remaining.remove(&sink);
        }
    }
    remaining.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn svc(id: &str, deps: &[&str]) -> Service {
        Service::new(id, ["true"]).depends_on(deps.iter().copied())
    }

    fn position(order: &[String], id: &str) -> usize {
        order.iter().position(|s| s == id).expect("id in order")
    }

    #[test]
    fn test_chain_order() {
        let graph = ServiceGraph::build(vec![
            svc("rag", &["embedding"]),
            svc("embedding", &["llama"]),
            svc("llama", &[]),
        ])
        .expect("acyclic");
        assert_eq!(graph.start_ids(), vec!["llama", "embedding", "rag"]);
        let stop: Vec<&str> = graph.stop_order().map(|s| s.id.as_str()).collect();
        assert_eq!(stop, vec!["rag", "embedding", "llama"]);
    }

    #[test]
    fn test_ties_broken_by_declaration_order() {
        let graph = ServiceGraph::build(vec![
            svc("tools", &[]),
            svc("rag", &["llama"]),
            svc("llama", &[]),
            svc("mcp", &[]),
        ])
        .expect("acyclic");
        assert_eq!(graph.start_ids(), vec!["tools", "llama", "rag", "mcp"]);
    }

    #[test]
    fn test_every_service_after_its_dependencies() {
        let services = vec![
            svc("e", &["b", "d"]),
            svc("d", &["a"]),
            svc("c", &[]),
            svc("b", &["a", "c"]),
            svc("a", &[]),
            svc("f", &["e", "c"]),
        ];
        let graph = ServiceGraph::build(services.clone()).expect("acyclic");
        let order = graph.start_ids();
        assert_eq!(order.len(), services.len());
        for s in &services {
            for dep in &s.depends_on {
                assert!(
                    position(&order, dep) < position(&order, &s.id),
                    "{dep} must precede {} in {order:?}",
                    s.id
                );
            }
        }

        let again = ServiceGraph::build(services).expect("acyclic");
        assert_eq!(again.start_ids(), order, "order must be deterministic");
    }

    #[test]
    fn test_duplicate_dependency_counts_once() {
        let graph = ServiceGraph::build(vec![svc("a", &[]), svc("b", &["a", "a"])]).expect("acyclic");
        assert_eq!(graph.start_ids(), vec!["a", "b"]);
        assert_eq!(graph.dependents_of("a").len(), 1);
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let err = ServiceGraph::build(vec![svc("a", &[]), svc("loop", &["loop"])]).unwrap_err();
        assert_eq!(err, ConfigError::CycleDetected(vec!["loop".to_string()]));
    }

    #[test]
    fn test_multi_node_cycle_reports_members_only() {
        let err = ServiceGraph::build(vec![
            svc("root", &[]),
            svc("a", &["root", "c"]),
            svc("b", &["a"]),
            svc("c", &["b"]),
            svc("downstream", &["c"]),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            ConfigError::CycleDetected(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn test_unknown_dependency() {
        let err = ServiceGraph::build(vec![svc("rag", &["vector-db"])]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnknownDependency {
                service: "rag".to_string(),
                dependency: "vector-db".to_string(),
            }
        );
    }

    #[test]
    fn test_duplicate_service() {
        let err = ServiceGraph::build(vec![svc("a", &[]), svc("a", &[])]).unwrap_err();
        assert_eq!(err, ConfigError::DuplicateService("a".to_string()));
    }

    #[test]
    fn test_lookup_helpers() {
        let graph = ServiceGraph::build(vec![
            svc("llama", &[]),
            svc("embedding", &["llama"]),
            svc("rag", &["embedding", "llama"]),
        ])
        .expect("acyclic");
        assert_eq!(graph.len(), 3);
        assert!(!graph.is_empty());
        let deps: Vec<&str> = graph.dependencies_of("rag").iter().map(|s| s.id.as_str()).collect();
        assert_eq!(deps, vec!["embedding", "llama"]);
        let dependents: Vec<&str> = graph.dependents_of("llama").iter().map(|s| s.id.as_str()).collect();
        assert_eq!(dependents, vec!["embedding", "rag"]);
        assert!(graph.get("missing").is_none());
        assert!(ServiceGraph::build(Vec::new()).expect("empty is valid").is_empty());
    }
}
