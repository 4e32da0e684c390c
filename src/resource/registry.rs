//! Resource registry

use super::{NamedResource, ResourceKind};
use crate::driver::RuntimeDriver;
use crate::error::ResourceError;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

type ResourceKey = (ResourceKind, String);

/// Proof of one instance's attachment to one resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentHandle {
    name: String,
    kind: ResourceKind,
    instance: String,
}

impl AttachmentHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }
}

/// Reference-counting registry of named volumes and networks.
///
/// Each name has its own lock, held across the driver call that
/// materializes or removes it; operations on different names never wait on
/// each other. The outer map lock is only held to look up or insert an
/// entry.
pub struct ResourceRegistry {
    driver: Arc<dyn RuntimeDriver>,
    entries: RwLock<HashMap<ResourceKey, Arc<Mutex<NamedResource>>>>,
}

impl ResourceRegistry {
    /// Create a registry backed by a runtime driver
    pub fn new(driver: Arc<dyn RuntimeDriver>) -> Self {
        Self {
            driver,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Record a top-level declaration without materializing it.
    ///
    /// External resources are treated as already present: they are never
    /// created or pruned.
    pub async fn declare(&self, name: &str, kind: ResourceKind, driver: Option<&str>, external: bool) {
        let entry = self.entry(name, kind).await;
        let mut resource = entry.lock().await;

        if resource.materialized && !resource.external {
            if let Some(driver) = driver {
                if driver != resource.driver {
                    tracing::warn!(
                        "{} {} already exists with driver {}, ignoring {}",
                        kind,
                        name,
                        resource.driver,
                        driver
                    );
                }
            }
            return;
        }

        if let Some(driver) = driver {
            resource.driver = driver.to_string();
        }
        if external {
            resource.external = true;
            resource.materialized = true;
        }
    }

    /// Attach an instance, creating the resource through the driver first
    /// if it does not exist yet.
    pub async fn attach(
        &self,
        name: &str,
        kind: ResourceKind,
        instance: &str,
    ) -> Result<AttachmentHandle, ResourceError> {
        let entry = self.entry(name, kind).await;
        let mut resource = entry.lock().await;

        if !resource.materialized {
            let created = match kind {
                ResourceKind::Volume => self.driver.create_volume(name, &resource.driver).await,
                ResourceKind::Network => self.driver.create_network(name, &resource.driver).await,
            };
            created.map_err(|source| ResourceError::Create {
                name: name.to_string(),
                kind,
                source,
            })?;

            resource.materialized = true;
            resource.created_at = Some(Utc::now());
            tracing::info!("Created {} {} (driver {})", kind, name, resource.driver);
        }

        resource.attached.insert(instance.to_string());
        tracing::debug!(
            resource = name,
            %kind,
            instance,
            ref_count = resource.ref_count(),
            "attached"
        );

        Ok(AttachmentHandle {
            name: name.to_string(),
            kind,
            instance: instance.to_string(),
        })
    }

    /// Release an attachment. The resource itself stays materialized even
    /// when nothing holds it anymore; only [`destroy_unused`] removes it.
    ///
    /// [`destroy_unused`]: ResourceRegistry::destroy_unused
    pub async fn detach(&self, handle: AttachmentHandle) -> Result<(), ResourceError> {
        let not_attached = || ResourceError::NotAttached {
            name: handle.name.clone(),
            kind: handle.kind,
            instance: handle.instance.clone(),
        };

        let entry = self
            .existing(&handle.name, handle.kind)
            .await
            .ok_or_else(not_attached)?;
        let mut resource = entry.lock().await;

        if !resource.attached.remove(&handle.instance) {
            return Err(not_attached());
        }

        tracing::debug!(
            resource = %handle.name,
            kind = %handle.kind,
            instance = %handle.instance,
            ref_count = resource.ref_count(),
            "detached"
        );
        Ok(())
    }

    /// Remove every materialized, stack-managed resource with no
    /// attachments. Returns the names removed.
    pub async fn destroy_unused(&self) -> Result<Vec<String>, ResourceError> {
        let mut entries: Vec<(ResourceKey, Arc<Mutex<NamedResource>>)> = self
            .entries
            .read()
            .await
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut destroyed = Vec::new();
        for ((kind, name), entry) in entries {
            let mut resource = entry.lock().await;
            if !resource.materialized || resource.external || !resource.attached.is_empty() {
                continue;
            }

            let removed = match kind {
                ResourceKind::Volume => self.driver.remove_volume(&name).await,
                ResourceKind::Network => self.driver.remove_network(&name).await,
            };
            removed.map_err(|source| ResourceError::Remove {
                name: name.clone(),
                kind,
                source,
            })?;

            resource.materialized = false;
            resource.created_at = None;
            tracing::info!("Removed unused {} {}", kind, name);
            destroyed.push(name);
        }

        Ok(destroyed)
    }

    /// Number of instances attached to a resource
    pub async fn ref_count(&self, name: &str, kind: ResourceKind) -> usize {
        match self.existing(name, kind).await {
            Some(entry) => entry.lock().await.ref_count(),
            None => 0,
        }
    }

    /// Whether the runtime object exists
    pub async fn is_materialized(&self, name: &str, kind: ResourceKind) -> bool {
        match self.existing(name, kind).await {
            Some(entry) => entry.lock().await.materialized,
            None => false,
        }
    }

    /// Snapshot of one resource
    pub async fn get(&self, name: &str, kind: ResourceKind) -> Option<NamedResource> {
        let entry = self.existing(name, kind).await?;
        let resource = entry.lock().await;
        Some(resource.clone())
    }

    /// Snapshot of every known resource, sorted by kind then name
    pub async fn list(&self) -> Vec<NamedResource> {
        let entries: Vec<Arc<Mutex<NamedResource>>> =
            self.entries.read().await.values().cloned().collect();

        let mut resources = Vec::with_capacity(entries.len());
        for entry in entries {
            resources.push(entry.lock().await.clone());
        }
        resources.sort_by(|a, b| (a.kind, &a.name).cmp(&(b.kind, &b.name)));
        resources
    }

    async fn existing(&self, name: &str, kind: ResourceKind) -> Option<Arc<Mutex<NamedResource>>> {
        self.entries
            .read()
            .await
            .get(&(kind, name.to_string()))
            .cloned()
    }

    async fn entry(&self, name: &str, kind: ResourceKind) -> Arc<Mutex<NamedResource>> {
        if let Some(entry) = self.existing(name, kind).await {
            return entry;
        }

        self.entries
            .write()
            .await
            .entry((kind, name.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(NamedResource::new(name, kind))))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{MemoryRuntime, RuntimeEvent};
    use crate::error::DriverError;

    fn registry() -> (MemoryRuntime, ResourceRegistry) {
        let runtime = MemoryRuntime::new();
        let registry = ResourceRegistry::new(Arc::new(runtime.clone()));
        (runtime, registry)
    }

    #[tokio::test]
    async fn test_shared_volume_survives_until_prune() {
        let (runtime, registry) = registry();

        let web = registry.attach("pgdata", ResourceKind::Volume, "shop-web-1").await.unwrap();
        let db = registry.attach("pgdata", ResourceKind::Volume, "shop-db-1").await.unwrap();
        let backup = registry
            .attach("pgdata", ResourceKind::Volume, "shop-backup-1")
            .await
            .unwrap();
        assert_eq!(registry.ref_count("pgdata", ResourceKind::Volume).await, 3);

        registry.detach(web).await.unwrap();
        registry.detach(db).await.unwrap();
        assert_eq!(registry.ref_count("pgdata", ResourceKind::Volume).await, 1);
        assert!(registry.is_materialized("pgdata", ResourceKind::Volume).await);

        registry.detach(backup).await.unwrap();
        assert_eq!(registry.ref_count("pgdata", ResourceKind::Volume).await, 0);
        assert!(registry.is_materialized("pgdata", ResourceKind::Volume).await);
        assert!(runtime.volume_exists("pgdata"));

        let destroyed = registry.destroy_unused().await.unwrap();
        assert_eq!(destroyed, vec!["pgdata".to_string()]);
        assert!(!runtime.volume_exists("pgdata"));
        assert!(!registry.is_materialized("pgdata", ResourceKind::Volume).await);
    }

    #[tokio::test]
    async fn test_prune_keeps_attached_resources() {
        let (_runtime, registry) = registry();
        registry.attach("cache", ResourceKind::Volume, "a-1").await.unwrap();
        let idle = registry.attach("scratch", ResourceKind::Volume, "b-1").await.unwrap();
        registry.detach(idle).await.unwrap();

        assert_eq!(registry.destroy_unused().await.unwrap(), vec!["scratch".to_string()]);
        assert!(registry.is_materialized("cache", ResourceKind::Volume).await);
    }

    #[tokio::test]
    async fn test_concurrent_attach_creates_once() {
        let (runtime, registry) = registry();
        let registry = Arc::new(registry);

        let attaches = (1..=8).map(|i| {
            let registry = registry.clone();
            async move {
                registry
                    .attach("backend", ResourceKind::Network, &format!("shop-api-{}", i))
                    .await
            }
        });
        let results = futures::future::join_all(attaches).await;
        assert!(results.iter().all(|r| r.is_ok()));

        let created = runtime
            .events()
            .into_iter()
            .filter(|e| *e == RuntimeEvent::NetworkCreated("backend".into()))
            .count();
        assert_eq!(created, 1);
        assert_eq!(registry.ref_count("backend", ResourceKind::Network).await, 8);
    }

    #[tokio::test]
    async fn test_create_failure_leaves_nothing_attached() {
        let (runtime, registry) = registry();
        runtime.fail_resource("broken");

        let err = registry
            .attach("broken", ResourceKind::Volume, "x-1")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ResourceError::Create {
                kind: ResourceKind::Volume,
                source: DriverError::Volume(_),
                ..
            }
        ));
        assert_eq!(registry.ref_count("broken", ResourceKind::Volume).await, 0);
        assert!(!registry.is_materialized("broken", ResourceKind::Volume).await);
    }

    #[tokio::test]
    async fn test_detach_twice_is_rejected() {
        let (_runtime, registry) = registry();
        let handle = registry.attach("data", ResourceKind::Volume, "x-1").await.unwrap();

        registry.detach(handle.clone()).await.unwrap();
        assert!(matches!(
            registry.detach(handle).await,
            Err(ResourceError::NotAttached { .. })
        ));
        assert_eq!(registry.ref_count("data", ResourceKind::Volume).await, 0);
    }

    #[tokio::test]
    async fn test_external_resources_are_never_created_or_pruned() {
        let (runtime, registry) = registry();
        registry
            .declare("shared-net", ResourceKind::Network, None, true)
            .await;

        let handle = registry
            .attach("shared-net", ResourceKind::Network, "x-1")
            .await
            .unwrap();
        registry.detach(handle).await.unwrap();

        assert!(registry.destroy_unused().await.unwrap().is_empty());
        assert!(!runtime.network_exists("shared-net"));
    }

    #[tokio::test]
    async fn test_declared_driver_and_kinds_are_separate() {
        let (_runtime, registry) = registry();
        registry
            .declare("data", ResourceKind::Volume, Some("nfs"), false)
            .await;

        registry.attach("data", ResourceKind::Volume, "x-1").await.unwrap();
        registry.attach("data", ResourceKind::Network, "x-1").await.unwrap();

        let volume = registry.get("data", ResourceKind::Volume).await.unwrap();
        let network = registry.get("data", ResourceKind::Network).await.unwrap();
        assert_eq!(volume.driver, "nfs");
        assert_eq!(network.driver, "bridge");
        assert_eq!(registry.list().await.len(), 2);
    }
}
