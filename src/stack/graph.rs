//! Service dependency graph
//!
//! Services live in a flat array and edges are indices into it, so
//! validation and cycle detection never chase references. Batches are
//! produced with Kahn's algorithm, either eagerly (`startup_batches`) or one
//! layer at a time through a [`BatchCursor`] that only releases a service
//! once its dependencies have actually satisfied their gates.

use super::service::{Gate, Service};
use crate::error::LoadError;
use std::collections::HashMap;

/// Validated dependency graph over the services of one stack
#[derive(Debug, Clone)]
pub struct ServiceGraph {
    services: Vec<Service>,
    index: HashMap<String, usize>,
    /// `dependencies[i]` lists the services `i` depends on, with their gate
    dependencies: Vec<Vec<(usize, Gate)>>,
}

impl ServiceGraph {
    /// Validate services and their edges and build the graph.
    ///
    /// Any violation rejects the whole set: nothing in a stack that fails
    /// to load is ever started.
    pub fn load(services: Vec<Service>) -> Result<Self, LoadError> {
        let mut index = HashMap::with_capacity(services.len());
        for (i, service) in services.iter().enumerate() {
            validate_service(service)?;
            if index.insert(service.name.clone(), i).is_some() {
                return Err(LoadError::DuplicateService(service.name.clone()));
            }
        }

        let mut dependencies: Vec<Vec<(usize, Gate)>> = vec![Vec::new(); services.len()];
        for (i, service) in services.iter().enumerate() {
            for dep in &service.depends_on {
                if dep.service == service.name {
                    return Err(LoadError::CycleDetected {
                        participants: vec![service.name.clone(), service.name.clone()],
                    });
                }

                let target = *index.get(&dep.service).ok_or_else(|| {
                    LoadError::UnknownDependency {
                        service: service.name.clone(),
                        target: dep.service.clone(),
                    }
                })?;

                if dep.gate == Gate::Healthy && services[target].healthcheck.is_none() {
                    return Err(LoadError::HealthGateWithoutProbe {
                        service: service.name.clone(),
                        target: dep.service.clone(),
                    });
                }

                // Repeated edges collapse to the stricter gate
                match dependencies[i].iter_mut().find(|(t, _)| *t == target) {
                    Some(existing) => {
                        if dep.gate == Gate::Healthy {
                            existing.1 = Gate::Healthy;
                        }
                    }
                    None => dependencies[i].push((target, dep.gate)),
                }
            }
        }

        if let Some(cycle) = find_cycle(&dependencies) {
            return Err(LoadError::CycleDetected {
                participants: cycle.into_iter().map(|i| services[i].name.clone()).collect(),
            });
        }

        Ok(Self {
            services,
            index,
            dependencies,
        })
    }

    /// Services in declaration order
    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Look up a service by name
    pub fn get(&self, name: &str) -> Option<&Service> {
        self.index.get(name).map(|&i| &self.services[i])
    }

    /// Whether the graph declares `name`
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Number of services
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether the graph has no services
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Dependencies of `name` with their effective gates
    pub fn dependencies_of(&self, name: &str) -> Vec<(&str, Gate)> {
        match self.index.get(name) {
            Some(&i) => self.dependencies[i]
                .iter()
                .map(|&(t, gate)| (self.services[t].name.as_str(), gate))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Services that depend on `name`
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        let Some(&target) = self.index.get(name) else {
            return Vec::new();
        };
        self.dependencies
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.iter().any(|&(t, _)| t == target))
            .map(|(i, _)| self.services[i].name.as_str())
            .collect()
    }

    /// All startup batches, dependencies first.
    ///
    /// Each batch may start in parallel. This is the topological layering
    /// only; orchestration advances a [`BatchCursor`] instead so that a
    /// batch is not released before its gates are met.
    pub fn startup_batches(&self) -> Vec<Vec<String>> {
        let mut cursor = self.cursor();
        let mut batches = Vec::new();
        loop {
            let batch = cursor.next_batch();
            if batch.is_empty() {
                break;
            }
            for name in &batch {
                cursor.mark_healthy(name);
            }
            batches.push(batch);
        }
        batches
    }

    /// Startup batches in reverse, dependents first
    pub fn shutdown_batches(&self) -> Vec<Vec<String>> {
        let mut batches = self.startup_batches();
        batches.reverse();
        batches
    }

    /// A fresh cursor with no gate satisfied yet
    pub fn cursor(&self) -> BatchCursor {
        let n = self.services.len();
        BatchCursor {
            names: self.services.iter().map(|s| s.name.clone()).collect(),
            dependencies: self.dependencies.clone(),
            started: vec![false; n],
            healthy: vec![false; n],
            issued: vec![false; n],
        }
    }
}

/// Lazy Kahn traversal driven by observed gate satisfaction
#[derive(Debug, Clone)]
pub struct BatchCursor {
    names: Vec<String>,
    dependencies: Vec<Vec<(usize, Gate)>>,
    started: Vec<bool>,
    healthy: Vec<bool>,
    issued: Vec<bool>,
}

impl BatchCursor {
    /// Release every not-yet-issued service whose gates are all met.
    ///
    /// An empty result means either everything was issued or the remaining
    /// services are waiting on gates that have not been marked.
    pub fn next_batch(&mut self) -> Vec<String> {
        let ready: Vec<usize> = (0..self.names.len())
            .filter(|&i| !self.issued[i])
            .filter(|&i| {
                self.dependencies[i]
                    .iter()
                    .all(|&(t, gate)| self.satisfied(t, gate))
            })
            .collect();

        for &i in &ready {
            self.issued[i] = true;
        }
        ready.into_iter().map(|i| self.names[i].clone()).collect()
    }

    /// Record that `name` has a running instance. Returns false for unknown names.
    pub fn mark_started(&mut self, name: &str) -> bool {
        match self.position(name) {
            Some(i) => {
                self.started[i] = true;
                true
            }
            None => false,
        }
    }

    /// Record that `name` is healthy, which also satisfies `started`
    pub fn mark_healthy(&mut self, name: &str) -> bool {
        match self.position(name) {
            Some(i) => {
                self.started[i] = true;
                self.healthy[i] = true;
                true
            }
            None => false,
        }
    }

    /// Whether `name` satisfies `gate`
    pub fn is_satisfied(&self, name: &str, gate: Gate) -> bool {
        self.position(name).is_some_and(|i| self.satisfied(i, gate))
    }

    /// Whether every service was issued
    pub fn is_complete(&self) -> bool {
        self.issued.iter().all(|&issued| issued)
    }

    /// Services not yet issued, in declaration order
    pub fn unissued(&self) -> Vec<String> {
        (0..self.names.len())
            .filter(|&i| !self.issued[i])
            .map(|i| self.names[i].clone())
            .collect()
    }

    /// First dependency of `name` whose gate is not met
    pub fn unmet_dependency(&self, name: &str) -> Option<(String, Gate)> {
        let i = self.position(name)?;
        self.dependencies[i]
            .iter()
            .find(|&&(t, gate)| !self.satisfied(t, gate))
            .map(|&(t, gate)| (self.names[t].clone(), gate))
    }

    fn satisfied(&self, i: usize, gate: Gate) -> bool {
        match gate {
            Gate::Started => self.started[i] || self.healthy[i],
            Gate::Healthy => self.healthy[i],
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

fn validate_service(service: &Service) -> Result<(), LoadError> {
    let invalid = |reason: &str| LoadError::InvalidService {
        service: service.name.clone(),
        reason: reason.to_string(),
    };

    if service.name.is_empty() {
        return Err(invalid("service name is empty"));
    }
    if service.replicas == 0 {
        return Err(invalid("replicas must be at least 1"));
    }
    if let Some(probe) = &service.healthcheck {
        if probe.command.is_empty() {
            return Err(invalid("healthcheck command is empty"));
        }
        if probe.retries == 0 {
            return Err(invalid("healthcheck retries must be at least 1"));
        }
    }
    Ok(())
}

/// Depth-first search over dependency edges; returns one cycle as a path
/// that starts and ends on the same index.
fn find_cycle(dependencies: &[Vec<(usize, Gate)>]) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Unvisited,
        Active,
        Done,
    }

    let mut marks = vec![Mark::Unvisited; dependencies.len()];
    for root in 0..dependencies.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }

        marks[root] = Mark::Active;
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
        while let Some(top) = stack.last_mut() {
            let node = top.0;
            if top.1 == dependencies[node].len() {
                marks[node] = Mark::Done;
                stack.pop();
                continue;
            }

            let (target, _) = dependencies[node][top.1];
            top.1 += 1;
            match marks[target] {
                Mark::Unvisited => {
                    marks[target] = Mark::Active;
                    stack.push((target, 0));
                }
                Mark::Active => {
                    let start = stack.iter().position(|&(n, _)| n == target).unwrap_or(0);
                    let mut cycle: Vec<usize> = stack[start..].iter().map(|&(n, _)| n).collect();
                    cycle.push(target);
                    return Some(cycle);
                }
                Mark::Done => {}
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::HealthProbe;

    fn probe() -> HealthProbe {
        HealthProbe::new(vec!["true".to_string()])
    }

    fn batch_index(batches: &[Vec<String>], name: &str) -> usize {
        batches
            .iter()
            .position(|b| b.iter().any(|n| n == name))
            .unwrap()
    }

    #[test]
    fn test_three_tier_batches() {
        let graph = ServiceGraph::load(vec![
            Service::new("web", "nginx").depends_on("api", Gate::Started),
            Service::new("api", "node")
                .depends_on("db", Gate::Healthy)
                .depends_on("cache", Gate::Started),
            Service::new("db", "postgres").healthcheck(probe()),
            Service::new("cache", "redis"),
        ])
        .unwrap();

        let batches = graph.startup_batches();
        assert_eq!(
            batches,
            vec![
                vec!["db".to_string(), "cache".to_string()],
                vec!["api".to_string()],
                vec!["web".to_string()],
            ]
        );
        assert_eq!(
            graph.shutdown_batches().first().unwrap(),
            &vec!["web".to_string()]
        );
    }

    #[test]
    fn test_batches_respect_every_edge() {
        let graph = ServiceGraph::load(vec![
            Service::new("a", "img").depends_on("b", Gate::Started).depends_on("c", Gate::Started),
            Service::new("b", "img").depends_on("d", Gate::Started),
            Service::new("c", "img").depends_on("d", Gate::Started),
            Service::new("d", "img"),
            Service::new("e", "img"),
        ])
        .unwrap();

        let batches = graph.startup_batches();
        let flat: Vec<&String> = batches.iter().flatten().collect();
        assert_eq!(flat.len(), 5);
        for service in graph.services() {
            assert_eq!(flat.iter().filter(|n| **n == &service.name).count(), 1);
            for dep in &service.depends_on {
                assert!(batch_index(&batches, &dep.service) < batch_index(&batches, &service.name));
            }
        }
    }

    #[test]
    fn test_two_node_cycle_rejected() {
        let result = ServiceGraph::load(vec![
            Service::new("a", "img").depends_on("b", Gate::Started),
            Service::new("b", "img").depends_on("a", Gate::Started),
        ]);

        match result {
            Err(LoadError::CycleDetected { participants }) => {
                assert_eq!(participants.first(), participants.last());
                assert!(participants.contains(&"a".to_string()));
                assert!(participants.contains(&"b".to_string()));
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_long_cycle_behind_acyclic_prefix() {
        let result = ServiceGraph::load(vec![
            Service::new("entry", "img").depends_on("x", Gate::Started),
            Service::new("x", "img").depends_on("y", Gate::Started),
            Service::new("y", "img").depends_on("z", Gate::Started),
            Service::new("z", "img").depends_on("x", Gate::Started),
        ]);

        match result {
            Err(LoadError::CycleDetected { participants }) => {
                assert_eq!(participants, vec!["x", "y", "z", "x"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let result = ServiceGraph::load(vec![Service::new("a", "img").depends_on("a", Gate::Started)]);
        assert!(matches!(result, Err(LoadError::CycleDetected { .. })));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let result = ServiceGraph::load(vec![Service::new("web", "nginx").depends_on("db", Gate::Started)]);
        assert_eq!(
            result.unwrap_err(),
            LoadError::UnknownDependency {
                service: "web".into(),
                target: "db".into()
            }
        );
    }

    #[test]
    fn test_health_gate_requires_probe() {
        let result = ServiceGraph::load(vec![
            Service::new("web", "nginx").depends_on("db", Gate::Healthy),
            Service::new("db", "postgres"),
        ]);
        assert_eq!(
            result.unwrap_err(),
            LoadError::HealthGateWithoutProbe {
                service: "web".into(),
                target: "db".into()
            }
        );
    }

    #[test]
    fn test_duplicate_and_invalid_services_rejected() {
        let duplicate = ServiceGraph::load(vec![Service::new("a", "x"), Service::new("a", "y")]);
        assert_eq!(duplicate.unwrap_err(), LoadError::DuplicateService("a".into()));

        let zero = ServiceGraph::load(vec![Service::new("a", "x").replicas(0)]);
        assert!(matches!(zero, Err(LoadError::InvalidService { .. })));

        let no_retries = ServiceGraph::load(vec![Service::new("a", "x").healthcheck(probe().retries(0))]);
        assert!(matches!(no_retries, Err(LoadError::InvalidService { .. })));
    }

    #[test]
    fn test_cursor_holds_health_gated_batch() {
        let graph = ServiceGraph::load(vec![
            Service::new("db", "postgres").healthcheck(probe()),
            Service::new("web", "nginx").depends_on("db", Gate::Healthy),
            Service::new("worker", "app").depends_on("db", Gate::Started),
        ])
        .unwrap();

        let mut cursor = graph.cursor();
        assert_eq!(cursor.next_batch(), vec!["db"]);
        assert!(cursor.next_batch().is_empty());

        cursor.mark_started("db");
        assert_eq!(cursor.next_batch(), vec!["worker"]);
        assert!(cursor.next_batch().is_empty());
        assert_eq!(
            cursor.unmet_dependency("web"),
            Some(("db".to_string(), Gate::Healthy))
        );

        cursor.mark_healthy("db");
        assert_eq!(cursor.next_batch(), vec!["web"]);
        assert!(cursor.is_complete());
    }

    #[test]
    fn test_repeated_edge_keeps_stricter_gate() {
        let graph = ServiceGraph::load(vec![
            Service::new("db", "postgres").healthcheck(probe()),
            Service::new("web", "nginx")
                .depends_on("db", Gate::Started)
                .depends_on("db", Gate::Healthy),
        ])
        .unwrap();

        assert_eq!(graph.dependencies_of("web"), vec![("db", Gate::Healthy)]);
        assert_eq!(graph.dependents_of("db"), vec!["web"]);
    }
}
