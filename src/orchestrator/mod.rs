//! Stack orchestration
//!
//! The [`Orchestrator`] drives a [`StackHandle`] through `up`, `down` and
//! `scale`. It owns every [`ServiceInstance`]; the health monitor and the
//! resource registry only ever see instance ids.

pub mod instance;
mod launcher;
mod up;

pub use instance::{instance_id, InstanceEvent, InstanceState, InstanceStatus, ServiceInstance};

use crate::cancel::CancelToken;
use crate::config::OrchestratorConfig;
use crate::driver::{AttachedResource, ImageProvider, ImageRef, InstanceSpec, RuntimeDriver};
use crate::error::{
    DriverError, FailureCause, LoadError, OrchestrationError, Result, ServiceFailure, StackFailure,
};
use crate::health::{HealthMonitor, HealthOutcome};
use crate::resource::{ResourceKind, ResourceRegistry};
use crate::stack::{Gate, Service, ServiceGraph, Stack, VolumeSource};
use chrono::Utc;
use launcher::Launcher;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

/// Label carrying the project name
pub const LABEL_PROJECT: &str = "com.runestack.project";
/// Label carrying the service name
pub const LABEL_SERVICE: &str = "com.runestack.service";
/// Label carrying the replica index
pub const LABEL_REPLICA: &str = "com.runestack.replica";

/// Mutable state of one stack, guarded by the handle's lock
pub(crate) struct StackState {
    project: String,
    stack: Stack,
    graph: ServiceGraph,
    /// Instances by service, then replica index
    instances: BTreeMap<String, BTreeMap<u32, ServiceInstance>>,
    /// Replica counts set by `scale`
    targets: HashMap<String, u32>,
}

impl StackState {
    fn desired(&self, service: &Service) -> u32 {
        self.targets
            .get(&service.name)
            .copied()
            .unwrap_or(service.replicas)
    }

    fn instance_mut(&mut self, service: &str, replica: u32) -> Option<&mut ServiceInstance> {
        self.instances.get_mut(service)?.get_mut(&replica)
    }

    fn insert(&mut self, instance: ServiceInstance) {
        self.instances
            .entry(instance.service.clone())
            .or_default()
            .insert(instance.replica, instance);
    }

    fn remove(&mut self, service: &str, replica: u32) -> Option<ServiceInstance> {
        let replicas = self.instances.get_mut(service)?;
        let instance = replicas.remove(&replica);
        if replicas.is_empty() {
            self.instances.remove(service);
        }
        instance
    }

    /// Instances holding a replica index, lowest index first
    fn active(&self, service: &str) -> impl Iterator<Item = &ServiceInstance> {
        self.instances
            .get(service)
            .into_iter()
            .flat_map(|replicas| replicas.values())
            .filter(|i| i.state.is_active())
    }

    /// Whether the instances of `dependency` currently satisfy `gate`
    fn gate_met(&self, dependency: &str, gate: Gate) -> bool {
        match gate {
            Gate::Started => self.active(dependency).any(|i| i.state.is_up()),
            Gate::Healthy => {
                let mut instances = self.active(dependency).peekable();
                instances.peek().is_some()
                    && instances.all(|i| i.state == InstanceState::Healthy)
            }
        }
    }

    fn statuses(&self) -> Vec<InstanceStatus> {
        self.instances
            .values()
            .flat_map(|replicas| replicas.values())
            .map(|i| i.status())
            .collect()
    }
}

/// A loaded stack. Every orchestrator call takes the handle's lock for its
/// whole duration, so calls on one stack never interleave.
#[derive(Clone)]
pub struct StackHandle {
    name: String,
    inner: Arc<Mutex<StackState>>,
}

impl StackHandle {
    /// Validate a stack definition
    pub fn load(stack: Stack) -> std::result::Result<Self, LoadError> {
        let graph = stack.graph()?;
        let name = stack.name.clone();
        tracing::debug!(stack = %name, services = graph.len(), "stack loaded");

        Ok(Self {
            name: name.clone(),
            inner: Arc::new(Mutex::new(StackState {
                project: name,
                stack,
                graph,
                instances: BTreeMap::new(),
                targets: HashMap::new(),
            })),
        })
    }

    /// Replace the definition. Waits for any in-flight operation; running
    /// instances are kept and picked up by the next `up`.
    pub async fn reload(&self, stack: Stack) -> std::result::Result<(), LoadError> {
        let graph = stack.graph()?;
        let mut state = self.inner.lock().await;
        state.targets.retain(|service, _| graph.contains(service));
        state.graph = graph;
        state.stack = stack;
        tracing::info!("Reloaded stack {}", self.name);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current definition
    pub async fn definition(&self) -> Stack {
        self.inner.lock().await.stack.clone()
    }

    /// Snapshot of every instance, by service then replica
    pub async fn status(&self) -> Vec<InstanceStatus> {
        self.inner.lock().await.statuses()
    }
}

/// Result of a successful `up`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpReport {
    /// Services in the order their batches were released
    pub batches: Vec<Vec<String>>,
    /// Instances started by this call
    pub started: Vec<String>,
    /// Instances that were already running
    pub unchanged: Vec<String>,
}

/// Result of a successful `down`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownReport {
    /// Stopped instances, in stop order
    pub stopped: Vec<String>,
}

/// Result of a successful `scale`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaleReport {
    pub service: String,
    pub from: u32,
    pub to: u32,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// Orchestrator
pub struct Orchestrator {
    launcher: Launcher,
    resources: Arc<ResourceRegistry>,
    health: HealthMonitor,
    events: broadcast::Sender<InstanceEvent>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Create an orchestrator over an image provider and a runtime driver
    pub fn new(
        images: Arc<dyn ImageProvider>,
        driver: Arc<dyn RuntimeDriver>,
        config: OrchestratorConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let resources = Arc::new(ResourceRegistry::new(driver.clone()));
        let health = HealthMonitor::new(driver.clone(), events.clone());
        let launcher = Launcher::new(images, driver, resources.clone(), &config);

        Self {
            launcher,
            resources,
            health,
            events,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Registry of named volumes and networks
    pub fn resources(&self) -> &ResourceRegistry {
        &self.resources
    }

    /// Subscribe to instance state transitions
    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.events.subscribe()
    }

    /// Bring a stack up batch by batch.
    ///
    /// Instances already running are left alone. A fatal failure stops
    /// every instance this call started and reports each failed service;
    /// unhealthy instances only block their health-gated dependents.
    pub async fn up(&self, stack: &StackHandle, cancel: &CancelToken) -> Result<UpReport> {
        let mut state = stack.inner.lock().await;
        tracing::info!(
            "Starting stack {} ({} services)",
            stack.name,
            state.graph.len()
        );

        self.declare_resources(&state.stack).await;
        up::UpRun::new(self, &mut state).execute(cancel).await
    }

    /// Stop every instance, dependents first. Volumes and networks stay
    /// materialized until [`prune`](Orchestrator::prune).
    ///
    /// Cancellation takes effect between shutdown batches.
    pub async fn down(&self, stack: &StackHandle, cancel: &CancelToken) -> Result<DownReport> {
        let mut state = stack.inner.lock().await;
        tracing::info!("Stopping stack {}", stack.name);

        // Services dropped by a reload go first
        let mut order: Vec<Vec<String>> = Vec::new();
        let orphans: Vec<String> = state
            .instances
            .keys()
            .filter(|service| !state.graph.contains(service))
            .cloned()
            .collect();
        if !orphans.is_empty() {
            order.push(orphans);
        }
        order.extend(state.graph.shutdown_batches());

        let mut report = DownReport::default();
        let mut failures = Vec::new();

        for batch in order {
            if cancel.is_cancelled() {
                tracing::warn!("Down of {} cancelled", stack.name);
                return Err(OrchestrationError::Cancelled);
            }

            let mut instances: Vec<ServiceInstance> = batch
                .iter()
                .filter_map(|service| state.instances.remove(service))
                .flat_map(|replicas| replicas.into_values())
                .collect();
            if instances.is_empty() {
                continue;
            }

            let had_handle: Vec<bool> = instances.iter().map(|i| i.handle.is_some()).collect();
            let results =
                futures::future::join_all(instances.iter_mut().map(|i| self.retire(i))).await;

            for ((instance, result), had_handle) in instances.into_iter().zip(results).zip(had_handle) {
                match result {
                    Ok(()) if had_handle => report.stopped.push(instance.id),
                    Ok(()) => {}
                    Err(e) => {
                        failures.push(ServiceFailure::instance(
                            &instance.service,
                            instance.replica,
                            FailureCause::Stop(e),
                        ));
                        state.insert(instance);
                    }
                }
            }
        }

        state.targets.clear();

        if failures.is_empty() {
            tracing::info!("Stack {} is down", stack.name);
            Ok(report)
        } else {
            Err(OrchestrationError::Down(StackFailure {
                failures,
                rolled_back: false,
            }))
        }
    }

    /// Change the replica count of one service.
    ///
    /// Scaling up requires the service's own dependencies to satisfy their
    /// gates right now; new replicas take indices after the current
    /// highest. Scaling down stops the highest indices first.
    pub async fn scale(&self, stack: &StackHandle, service: &str, replicas: u32) -> Result<ScaleReport> {
        let mut state = stack.inner.lock().await;
        let definition = state
            .graph
            .get(service)
            .cloned()
            .ok_or_else(|| OrchestrationError::ServiceNotFound(service.to_string()))?;

        let active: Vec<u32> = state.active(service).map(|i| i.replica).collect();
        let current = active.len() as u32;
        let mut report = ScaleReport {
            service: service.to_string(),
            from: current,
            to: replicas,
            added: Vec::new(),
            removed: Vec::new(),
        };

        tracing::info!("Scaling {} from {} to {}", service, current, replicas);

        if replicas > current {
            let unmet = state
                .graph
                .dependencies_of(service)
                .into_iter()
                .find(|&(dependency, gate)| !state.gate_met(dependency, gate))
                .map(|(dependency, gate)| (dependency.to_string(), gate));
            if let Some((dependency, gate)) = unmet {
                return Err(OrchestrationError::GateNotSatisfied {
                    service: service.to_string(),
                    dependency,
                    gate,
                });
            }

            let next = active.last().copied().unwrap_or(0) + 1;
            let outcome = self
                .scale_up(&mut state, &definition, next..next + (replicas - current))
                .await;
            // Unhealthy replicas keep running, so the new count stands
            if let Err(OrchestrationError::Scale(failure)) = &outcome {
                if !failure.rolled_back {
                    state.targets.insert(service.to_string(), replicas);
                }
            }
            report.added = outcome?;
        } else if replicas < current {
            let mut failures = Vec::new();
            for replica in active.iter().rev().take((current - replicas) as usize) {
                let Some(mut instance) = state.remove(service, *replica) else {
                    continue;
                };
                match self.retire(&mut instance).await {
                    Ok(()) => report.removed.push(instance.id),
                    Err(e) => {
                        failures.push(ServiceFailure::instance(service, *replica, FailureCause::Stop(e)));
                        state.insert(instance);
                    }
                }
            }
            if !failures.is_empty() {
                return Err(OrchestrationError::Scale(StackFailure {
                    failures,
                    rolled_back: false,
                }));
            }
        }

        state.targets.insert(service.to_string(), replicas);
        Ok(report)
    }

    /// Snapshot of every instance of a stack
    pub async fn status(&self, stack: &StackHandle) -> Vec<InstanceStatus> {
        stack.status().await
    }

    /// Remove materialized volumes and networks nothing is attached to.
    /// Returns the names removed.
    pub async fn prune(&self, stack: &StackHandle) -> Result<Vec<String>> {
        let _state = stack.inner.lock().await;
        let removed = self.resources.destroy_unused().await?;
        if !removed.is_empty() {
            tracing::info!("Pruned {} unused resource(s) of {}", removed.len(), stack.name);
        }
        Ok(removed)
    }

    async fn declare_resources(&self, stack: &Stack) {
        for (name, decl) in &stack.volumes {
            self.resources
                .declare(name, ResourceKind::Volume, decl.driver.as_deref(), decl.external)
                .await;
        }
        for (name, decl) in &stack.networks {
            self.resources
                .declare(name, ResourceKind::Network, decl.driver.as_deref(), decl.external)
                .await;
        }
    }

    async fn scale_up(
        &self,
        state: &mut StackState,
        service: &Service,
        replicas: std::ops::Range<u32>,
    ) -> Result<Vec<String>> {
        let scale_failure = |failures: Vec<ServiceFailure>, rolled_back: bool| {
            OrchestrationError::Scale(StackFailure {
                failures,
                rolled_back,
            })
        };

        let image = self
            .launcher
            .resolve(&service.name, &service.image, service.restart)
            .await
            .map_err(|cause| scale_failure(vec![ServiceFailure::service(&service.name, cause)], false))?;

        let mut failures = Vec::new();
        let mut launches = Vec::new();
        for replica in replicas.clone() {
            if let Some(stale) = state.remove(&service.name, replica) {
                self.launcher.detach_all(stale.attachments).await;
            }

            let (spec, resources) = instance_plan(&state.project, service, replica, &image);
            let mut instance = ServiceInstance::new(&state.project, &service.name, replica);
            self.transition(&mut instance, InstanceState::Starting);

            match self.launcher.attach_all(&instance.id, &resources).await {
                Ok(attachments) => {
                    instance.attachments = attachments;
                    launches.push((replica, spec, resources));
                }
                Err(cause) => {
                    instance.last_error = Some(cause.to_string());
                    self.transition(&mut instance, InstanceState::Failed);
                    failures.push(ServiceFailure::instance(&service.name, replica, cause));
                }
            }
            state.insert(instance);
        }

        let mut started = Vec::new();
        if failures.is_empty() {
            let attempts = self.launcher.start_attempts(service.restart);
            let results = futures::future::join_all(launches.into_iter().map(
                |(replica, spec, resources)| {
                    let launcher = self.launcher.clone();
                    async move { (replica, launcher.launch(spec, resources, attempts).await) }
                },
            ))
            .await;

            for (replica, result) in results {
                let Some(instance) = state.instance_mut(&service.name, replica) else {
                    continue;
                };
                match result {
                    Ok(launched) => {
                        instance.handle = Some(launched.handle.clone());
                        instance.restarts = launched.attempts - 1;
                        instance.started_at = Some(Utc::now());
                        self.transition(instance, InstanceState::Running);
                        started.push((replica, launched.handle));
                    }
                    Err(cause) => {
                        instance.last_error = Some(cause.to_string());
                        self.transition(instance, InstanceState::Failed);
                        let attachments = std::mem::take(&mut instance.attachments);
                        self.launcher.detach_all(attachments).await;
                        failures.push(ServiceFailure::instance(&service.name, replica, cause));
                    }
                }
            }
        }

        if !failures.is_empty() {
            // Undo everything this call created that is not already failed
            for replica in replicas.rev() {
                let Some(instance) = state.instance_mut(&service.name, replica) else {
                    continue;
                };
                if instance.state == InstanceState::Failed {
                    continue;
                }
                if let Err(e) = self.retire(instance).await {
                    tracing::warn!("Rollback of {} failed: {}", instance.id, e);
                    continue;
                }
                state.remove(&service.name, replica);
            }
            return Err(scale_failure(failures, true));
        }

        let mut added = Vec::new();
        if let Some(probe) = &service.healthcheck {
            let mut watches = Vec::new();
            for (replica, handle) in started {
                if let Some(instance) = state.instance_mut(&service.name, replica) {
                    Self::record_health(instance, InstanceState::HealthChecking);
                }
                watches.push((replica, self.health.watch(&service.name, handle, probe.clone())));
            }

            let outcomes = futures::future::join_all(
                watches
                    .into_iter()
                    .map(|(replica, watch)| async move { (replica, watch.outcome().await) }),
            )
            .await;

            for (replica, outcome) in outcomes {
                let Some(instance) = state.instance_mut(&service.name, replica) else {
                    continue;
                };
                added.push(instance.id.clone());
                match outcome {
                    HealthOutcome::Healthy { .. } => {
                        Self::record_health(instance, InstanceState::Healthy)
                    }
                    HealthOutcome::Unhealthy { checks, last_error } => {
                        Self::record_health(instance, InstanceState::Unhealthy);
                        instance.last_error = Some(last_error.clone());
                        failures.push(ServiceFailure::instance(
                            &service.name,
                            replica,
                            FailureCause::Unhealthy { checks, last_error },
                        ));
                    }
                    HealthOutcome::Cancelled => {}
                }
            }
        } else {
            for (replica, _) in started {
                added.push(instance_id(&state.project, &service.name, replica));
            }
        }

        if !failures.is_empty() {
            return Err(scale_failure(failures, false));
        }
        Ok(added)
    }

    /// Stop an instance if it runs and release its resources. A failed stop
    /// leaves the handle and attachments in place so a later call can retry.
    async fn retire(&self, instance: &mut ServiceInstance) -> std::result::Result<(), DriverError> {
        if let Some(handle) = instance.handle.clone() {
            self.transition(instance, InstanceState::Stopping);
            if let Err(e) = self.launcher.stop(&handle).await {
                tracing::error!("Failed to stop {}: {}", instance.id, e);
                instance.last_error = Some(e.to_string());
                self.transition(instance, InstanceState::Failed);
                return Err(e);
            }
            instance.handle = None;
            self.transition(instance, InstanceState::Stopped);
        } else {
            self.transition(instance, InstanceState::Stopped);
        }

        let attachments = std::mem::take(&mut instance.attachments);
        self.launcher.detach_all(attachments).await;
        Ok(())
    }

    /// Set an instance state and publish the transition
    fn transition(&self, instance: &mut ServiceInstance, state: InstanceState) {
        instance.state = state;
        let _ = self.events.send(InstanceEvent {
            instance: instance.id.clone(),
            service: instance.service.clone(),
            state,
            at: Utc::now(),
        });
    }

    /// Set a health state without publishing it. The health monitor already
    /// broadcasts `health_checking`, `healthy` and `unhealthy` for the
    /// instances it watches.
    fn record_health(instance: &mut ServiceInstance, state: InstanceState) {
        debug_assert!(matches!(
            state,
            InstanceState::HealthChecking | InstanceState::Healthy | InstanceState::Unhealthy
        ));
        instance.state = state;
    }
}

/// Runtime spec and registry-managed resources for one replica
fn instance_plan(
    project: &str,
    service: &Service,
    replica: u32,
    image: &ImageRef,
) -> (InstanceSpec, Vec<AttachedResource>) {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_PROJECT.to_string(), project.to_string());
    labels.insert(LABEL_SERVICE.to_string(), service.name.clone());
    labels.insert(LABEL_REPLICA.to_string(), replica.to_string());

    let mut resources = Vec::new();
    let mut mounts = Vec::new();
    for volume in service.volumes() {
        match &volume.source {
            VolumeSource::Named(name) => resources.push(AttachedResource {
                name: name.clone(),
                kind: ResourceKind::Volume,
                target: Some(volume.target.clone()),
                read_only: volume.read_only,
            }),
            VolumeSource::Host(_) | VolumeSource::Anonymous => mounts.push(volume.clone()),
        }
    }
    for network in service.networks() {
        resources.push(AttachedResource {
            name: network.to_string(),
            kind: ResourceKind::Network,
            target: None,
            read_only: false,
        });
    }

    let spec = InstanceSpec {
        id: instance_id(project, &service.name, replica),
        service: service.name.clone(),
        replica,
        image: image.clone(),
        command: service.command.clone(),
        environment: service.environment.clone(),
        ports: service.ports().cloned().collect(),
        mounts,
        labels,
    };
    (spec, resources)
}
