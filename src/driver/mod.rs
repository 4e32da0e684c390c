//! Collaborator interfaces
//!
//! The orchestration core never builds images or runs processes itself. It
//! asks an [`ImageProvider`] for a content-addressable image reference and a
//! [`RuntimeDriver`] to start, stop and probe instances and to create the
//! volumes and networks they attach to.

pub mod memory;

pub use memory::{MemoryRuntime, ProbeStep, RuntimeEvent};

use crate::error::DriverError;
use crate::resource::ResourceKind;
use crate::stack::{ImageSource, PortBinding, VolumeBinding};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Resolved image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Human readable reference, e.g. `postgres:16`
    pub reference: String,
    /// Content digest, e.g. `sha256:...`
    pub digest: String,
}

/// Everything the runtime needs to start one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSpec {
    /// Instance id, `<project>-<service>-<replica>`
    pub id: String,
    pub service: String,
    pub replica: u32,
    pub image: ImageRef,
    pub command: Option<Vec<String>>,
    pub environment: BTreeMap<String, String>,
    pub ports: Vec<PortBinding>,
    /// Bind mounts and anonymous volumes; named volumes arrive as
    /// [`AttachedResource`]s
    pub mounts: Vec<VolumeBinding>,
    pub labels: BTreeMap<String, String>,
}

/// A registry-managed volume or network handed to the runtime at start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedResource {
    pub name: String,
    pub kind: ResourceKind,
    /// Mount path for volumes
    pub target: Option<String>,
    pub read_only: bool,
}

/// Opaque runtime handle for a started instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuntimeHandle {
    /// Runtime-assigned id
    pub id: String,
    /// Instance id the handle belongs to
    pub instance: String,
}

/// Exit status of a probe command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitStatus {
    pub code: i32,
    pub output: String,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Builds or pulls images
#[async_trait]
pub trait ImageProvider: Send + Sync {
    /// Resolve an image source to a content-addressable reference
    async fn resolve(&self, source: &ImageSource) -> Result<ImageRef, DriverError>;
}

/// Starts, stops and inspects instances; owns volume and network objects
#[async_trait]
pub trait RuntimeDriver: Send + Sync {
    /// Start an instance with its resources attached
    async fn start(
        &self,
        spec: &InstanceSpec,
        resources: &[AttachedResource],
    ) -> Result<RuntimeHandle, DriverError>;

    /// Stop an instance
    async fn stop(&self, handle: &RuntimeHandle) -> Result<(), DriverError>;

    /// Run a probe command inside an instance
    async fn probe(&self, handle: &RuntimeHandle, command: &[String])
        -> Result<ExitStatus, DriverError>;

    /// Create a named volume
    async fn create_volume(&self, name: &str, driver: &str) -> Result<(), DriverError>;

    /// Create a named network
    async fn create_network(&self, name: &str, driver: &str) -> Result<(), DriverError>;

    /// Remove a named volume
    async fn remove_volume(&self, name: &str) -> Result<(), DriverError>;

    /// Remove a named network
    async fn remove_network(&self, name: &str) -> Result<(), DriverError>;
}
