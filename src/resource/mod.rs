//! Named resource management
//!
//! Volumes and networks declared by name are shared by every service that
//! mounts or joins them. The [`ResourceRegistry`] materializes them lazily
//! and tracks which instances hold them.

pub mod registry;

pub use registry::{AttachmentHandle, ResourceRegistry};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Default driver for volumes
pub const DEFAULT_VOLUME_DRIVER: &str = "local";

/// Default driver for networks
pub const DEFAULT_NETWORK_DRIVER: &str = "bridge";

/// Kind of named resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Volume,
    Network,
}

impl ResourceKind {
    /// Driver used when the declaration names none
    pub fn default_driver(&self) -> &'static str {
        match self {
            ResourceKind::Volume => DEFAULT_VOLUME_DRIVER,
            ResourceKind::Network => DEFAULT_NETWORK_DRIVER,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Volume => write!(f, "volume"),
            ResourceKind::Network => write!(f, "network"),
        }
    }
}

/// A volume or network shared by declared name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedResource {
    pub name: String,
    pub kind: ResourceKind,
    pub driver: String,
    /// Managed outside the stack
    pub external: bool,
    /// Whether the runtime object exists
    pub materialized: bool,
    /// Instance ids currently attached
    pub attached: BTreeSet<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl NamedResource {
    pub fn new(name: &str, kind: ResourceKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            driver: kind.default_driver().to_string(),
            external: false,
            materialized: false,
            attached: BTreeSet::new(),
            created_at: None,
        }
    }

    /// Number of attached instances
    pub fn ref_count(&self) -> usize {
        self.attached.len()
    }
}
