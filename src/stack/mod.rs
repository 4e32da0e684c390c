//! Stack model
//!
//! A stack is a named set of services plus the volumes and networks they
//! declare at top level. The [`ServiceGraph`] validates it.

pub mod graph;
pub mod service;

pub use graph::{BatchCursor, ServiceGraph};
pub use service::{
    Binding, Dependency, Gate, HealthProbe, ImageSource, PortBinding, Protocol, RestartPolicy,
    Service, VolumeBinding, VolumeSource,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Top-level volume or network declaration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDecl {
    /// Driver name; the registry default applies when unset
    pub driver: Option<String>,
    /// Created outside the stack: never materialized or pruned by it
    pub external: bool,
}

/// A loaded stack definition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stack {
    pub name: String,
    pub services: Vec<Service>,
    pub volumes: BTreeMap<String, ResourceDecl>,
    pub networks: BTreeMap<String, ResourceDecl>,
}

impl Stack {
    /// Create an empty stack
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Add a service, replacing any service with the same name
    pub fn service(mut self, service: Service) -> Self {
        self.put_service(service);
        self
    }

    /// Declare a volume
    pub fn volume(mut self, name: &str, decl: ResourceDecl) -> Self {
        self.volumes.insert(name.to_string(), decl);
        self
    }

    /// Declare a network
    pub fn network(mut self, name: &str, decl: ResourceDecl) -> Self {
        self.networks.insert(name.to_string(), decl);
        self
    }

    /// Look up a service
    pub fn get(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Layer a later definition over this one.
    ///
    /// A service declared again replaces the earlier one wholesale, in
    /// place; fields are never merged. New services are appended.
    pub fn overlay(mut self, later: Stack) -> Self {
        if !later.name.is_empty() {
            self.name = later.name;
        }
        for service in later.services {
            self.put_service(service);
        }
        self.volumes.extend(later.volumes);
        self.networks.extend(later.networks);
        self
    }

    /// Validate the services into a dependency graph
    pub fn graph(&self) -> Result<ServiceGraph, crate::error::LoadError> {
        ServiceGraph::load(self.services.clone())
    }

    fn put_service(&mut self, service: Service) {
        match self.services.iter_mut().find(|s| s.name == service.name) {
            Some(existing) => *existing = service,
            None => self.services.push(service),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_replaces_services_wholesale() {
        let base = Stack::new("shop")
            .service(
                Service::new("db", "postgres:15")
                    .env("POSTGRES_PASSWORD", "secret")
                    .volume("pgdata", "/var/lib/postgresql/data"),
            )
            .service(Service::new("web", "nginx"));
        let later = Stack::new("")
            .service(Service::new("db", "postgres:16"))
            .service(Service::new("cache", "redis"));

        let stack = base.overlay(later);
        assert_eq!(stack.name, "shop");
        let names: Vec<&str> = stack.services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["db", "web", "cache"]);

        let db = stack.get("db").unwrap();
        assert_eq!(db.image, ImageSource::Image("postgres:16".into()));
        assert!(db.environment.is_empty());
        assert!(db.bindings.is_empty());
    }
}
