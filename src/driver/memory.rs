//! In-memory runtime
//!
//! Implements both collaborator traits without touching the host. Start
//! failures, start latency, probe outcomes and resource failures can be
//! scripted per service, and every driver call is appended to an ordered
//! event log so callers can assert on sequencing.

use super::{
    AttachedResource, ExitStatus, ImageProvider, ImageRef, InstanceSpec, RuntimeDriver,
    RuntimeHandle,
};
use crate::error::DriverError;
use crate::resource::ResourceKind;
use crate::stack::ImageSource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use uuid::Uuid;

/// Scripted outcome of one probe call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStep {
    /// Exit 0
    Pass,
    /// Exit 1
    Fail,
    /// Never return
    Hang,
}

/// One recorded driver call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    ImageResolved { reference: String },
    Started { instance: String },
    StartFailed { instance: String },
    Stopped { instance: String },
    Probed { instance: String, passed: bool },
    VolumeCreated(String),
    NetworkCreated(String),
    VolumeRemoved(String),
    NetworkRemoved(String),
}

/// A started instance
#[derive(Debug, Clone)]
struct RunningInstance {
    spec: InstanceSpec,
    resources: Vec<AttachedResource>,
    started_at: DateTime<Utc>,
    probes: usize,
}

#[derive(Debug, Default)]
struct Script {
    /// Remaining start failures per service; `u32::MAX` never runs out
    start_failures: HashMap<String, u32>,
    start_delays: HashMap<String, Duration>,
    probe_steps: HashMap<String, Vec<ProbeStep>>,
    failing_images: HashSet<String>,
    failing_resources: HashSet<String>,
}

#[derive(Debug, Default)]
struct State {
    /// Running instances indexed by runtime handle id
    instances: HashMap<String, RunningInstance>,
    volumes: BTreeMap<String, String>,
    networks: BTreeMap<String, String>,
    events: Vec<RuntimeEvent>,
    script: Script,
}

/// In-memory image provider and runtime driver
#[derive(Debug, Clone, Default)]
pub struct MemoryRuntime {
    state: Arc<RwLock<State>>,
}

impl MemoryRuntime {
    /// Create an empty runtime
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` starts of `service`
    pub fn fail_starts(&self, service: &str, times: u32) {
        self.inspect_mut()
            .script
            .start_failures
            .insert(service.to_string(), times);
    }

    /// Fail every start of `service`
    pub fn fail_starts_always(&self, service: &str) {
        self.fail_starts(service, u32::MAX);
    }

    /// Delay every start of `service`
    pub fn delay_starts(&self, service: &str, delay: Duration) {
        self.inspect_mut()
            .script
            .start_delays
            .insert(service.to_string(), delay);
    }

    /// Script probe outcomes for each instance of `service`; once the
    /// script runs out every further probe passes
    pub fn script_probe(&self, service: &str, steps: Vec<ProbeStep>) {
        self.inspect_mut()
            .script
            .probe_steps
            .insert(service.to_string(), steps);
    }

    /// Fail resolution of an image reference or build tag
    pub fn fail_image(&self, reference: &str) {
        self.inspect_mut()
            .script
            .failing_images
            .insert(reference.to_string());
    }

    /// Fail creation of a volume or network
    pub fn fail_resource(&self, name: &str) {
        self.inspect_mut()
            .script
            .failing_resources
            .insert(name.to_string());
    }

    /// Recorded driver calls, oldest first
    pub fn events(&self) -> Vec<RuntimeEvent> {
        self.inspect().events.clone()
    }

    /// Index of the first recorded event equal to `event`
    pub fn position(&self, event: &RuntimeEvent) -> Option<usize> {
        self.inspect().events.iter().position(|e| e == event)
    }

    /// Ids of running instances, sorted
    pub fn running_instances(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inspect()
            .instances
            .values()
            .map(|i| i.spec.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Whether an instance id is running
    pub fn is_running(&self, instance: &str) -> bool {
        self.inspect()
            .instances
            .values()
            .any(|i| i.spec.id == instance)
    }

    /// Number of probes executed against a running instance
    pub fn probe_count(&self, instance: &str) -> usize {
        self.inspect()
            .instances
            .values()
            .find(|i| i.spec.id == instance)
            .map(|i| i.probes)
            .unwrap_or(0)
    }

    /// Resources a running instance was started with
    pub fn resources_of(&self, instance: &str) -> Vec<AttachedResource> {
        self.inspect()
            .instances
            .values()
            .find(|i| i.spec.id == instance)
            .map(|i| i.resources.clone())
            .unwrap_or_default()
    }

    /// Start time of a running instance
    pub fn started_at(&self, instance: &str) -> Option<DateTime<Utc>> {
        self.inspect()
            .instances
            .values()
            .find(|i| i.spec.id == instance)
            .map(|i| i.started_at)
    }

    /// Whether a volume object exists
    pub fn volume_exists(&self, name: &str) -> bool {
        self.inspect().volumes.contains_key(name)
    }

    /// Whether a network object exists
    pub fn network_exists(&self, name: &str) -> bool {
        self.inspect().networks.contains_key(name)
    }

    fn inspect(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn inspect_mut(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, DriverError> {
        self.state
            .write()
            .map_err(|_| DriverError::Internal("Failed to acquire write lock".to_string()))
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, DriverError> {
        self.state
            .read()
            .map_err(|_| DriverError::Internal("Failed to acquire read lock".to_string()))
    }
}

fn digest_of(reference: &str) -> String {
    let hash = Sha256::digest(reference.as_bytes());
    let hex: String = hash.iter().map(|b| format!("{:02x}", b)).collect();
    format!("sha256:{}", hex)
}

#[async_trait]
impl ImageProvider for MemoryRuntime {
    async fn resolve(&self, source: &ImageSource) -> Result<ImageRef, DriverError> {
        let mut state = self.write()?;

        let reference = match source {
            ImageSource::Image(reference) => {
                if state.script.failing_images.contains(reference) {
                    return Err(DriverError::Image(format!(
                        "pull access denied for {}",
                        reference
                    )));
                }
                reference.clone()
            }
            ImageSource::Build { context, tag, .. } => {
                if state.script.failing_images.contains(tag) {
                    return Err(DriverError::Build(format!(
                        "build of {} from {} failed",
                        tag,
                        context.display()
                    )));
                }
                tag.clone()
            }
        };

        state.events.push(RuntimeEvent::ImageResolved {
            reference: reference.clone(),
        });

        Ok(ImageRef {
            digest: digest_of(&reference),
            reference,
        })
    }
}

#[async_trait]
impl RuntimeDriver for MemoryRuntime {
    async fn start(
        &self,
        spec: &InstanceSpec,
        resources: &[AttachedResource],
    ) -> Result<RuntimeHandle, DriverError> {
        let delay = self.read()?.script.start_delays.get(&spec.service).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.write()?;

        if let Some(remaining) = state.script.start_failures.get_mut(&spec.service) {
            if *remaining > 0 {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                state.events.push(RuntimeEvent::StartFailed {
                    instance: spec.id.clone(),
                });
                return Err(DriverError::Start(format!("{} exited with code 1", spec.id)));
            }
        }

        if state.instances.values().any(|i| i.spec.id == spec.id) {
            return Err(DriverError::Start(format!("{} is already running", spec.id)));
        }

        for resource in resources {
            let exists = match resource.kind {
                ResourceKind::Volume => state.volumes.contains_key(&resource.name),
                ResourceKind::Network => state.networks.contains_key(&resource.name),
            };
            if !exists {
                return Err(DriverError::Start(format!(
                    "{} {} not found",
                    resource.kind, resource.name
                )));
            }
        }

        let handle = RuntimeHandle {
            id: Uuid::new_v4().to_string().replace("-", "")[..12].to_string(),
            instance: spec.id.clone(),
        };

        state.instances.insert(
            handle.id.clone(),
            RunningInstance {
                spec: spec.clone(),
                resources: resources.to_vec(),
                started_at: Utc::now(),
                probes: 0,
            },
        );
        state.events.push(RuntimeEvent::Started {
            instance: spec.id.clone(),
        });

        Ok(handle)
    }

    async fn stop(&self, handle: &RuntimeHandle) -> Result<(), DriverError> {
        let mut state = self.write()?;

        let instance = state
            .instances
            .remove(&handle.id)
            .ok_or_else(|| DriverError::UnknownHandle(handle.id.clone()))?;

        state.events.push(RuntimeEvent::Stopped {
            instance: instance.spec.id,
        });

        Ok(())
    }

    async fn probe(
        &self,
        handle: &RuntimeHandle,
        _command: &[String],
    ) -> Result<ExitStatus, DriverError> {
        let step = {
            let mut state = self.write()?;
            let state = &mut *state;

            let instance = state
                .instances
                .get_mut(&handle.id)
                .ok_or_else(|| DriverError::UnknownHandle(handle.id.clone()))?;

            let step = state
                .script
                .probe_steps
                .get(&instance.spec.service)
                .and_then(|steps| steps.get(instance.probes))
                .copied()
                .unwrap_or(ProbeStep::Pass);
            instance.probes += 1;

            state.events.push(RuntimeEvent::Probed {
                instance: instance.spec.id.clone(),
                passed: step == ProbeStep::Pass,
            });
            step
        };

        match step {
            ProbeStep::Pass => Ok(ExitStatus {
                code: 0,
                output: String::new(),
            }),
            ProbeStep::Fail => Ok(ExitStatus {
                code: 1,
                output: "probe failed".to_string(),
            }),
            ProbeStep::Hang => {
                std::future::pending::<()>().await;
                Err(DriverError::Probe("probe never returned".to_string()))
            }
        }
    }

    async fn create_volume(&self, name: &str, driver: &str) -> Result<(), DriverError> {
        let mut state = self.write()?;
        if state.script.failing_resources.contains(name) {
            return Err(DriverError::Volume(format!(
                "driver {} failed to create {}",
                driver, name
            )));
        }
        state.volumes.insert(name.to_string(), driver.to_string());
        state.events.push(RuntimeEvent::VolumeCreated(name.to_string()));
        Ok(())
    }

    async fn create_network(&self, name: &str, driver: &str) -> Result<(), DriverError> {
        let mut state = self.write()?;
        if state.script.failing_resources.contains(name) {
            return Err(DriverError::Network(format!(
                "driver {} failed to create {}",
                driver, name
            )));
        }
        state.networks.insert(name.to_string(), driver.to_string());
        state.events.push(RuntimeEvent::NetworkCreated(name.to_string()));
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<(), DriverError> {
        let mut state = self.write()?;
        state
            .volumes
            .remove(name)
            .ok_or_else(|| DriverError::Volume(format!("volume {} not found", name)))?;
        state.events.push(RuntimeEvent::VolumeRemoved(name.to_string()));
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), DriverError> {
        let mut state = self.write()?;
        state
            .networks
            .remove(name)
            .ok_or_else(|| DriverError::Network(format!("network {} not found", name)))?;
        state.events.push(RuntimeEvent::NetworkRemoved(name.to_string()));
        Ok(())
    }
}
