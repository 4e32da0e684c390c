//! Service instances

use crate::driver::RuntimeHandle;
use crate::resource::AttachmentHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Instance lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Starting,
    Running,
    HealthChecking,
    Healthy,
    Unhealthy,
    Stopping,
    Stopped,
    Failed,
}

impl InstanceState {
    /// The runtime reports the instance running
    pub fn is_up(&self) -> bool {
        matches!(
            self,
            InstanceState::Running
                | InstanceState::HealthChecking
                | InstanceState::Healthy
                | InstanceState::Unhealthy
        )
    }

    /// Holds a replica index: anything not stopped or failed
    pub fn is_active(&self) -> bool {
        !matches!(self, InstanceState::Stopped | InstanceState::Failed)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Pending => "pending",
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::HealthChecking => "health-checking",
            InstanceState::Healthy => "healthy",
            InstanceState::Unhealthy => "unhealthy",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// A state transition, broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceEvent {
    pub instance: String,
    pub service: String,
    pub state: InstanceState,
    pub at: DateTime<Utc>,
}

/// One replica of a service, owned by the orchestrator
#[derive(Debug)]
pub struct ServiceInstance {
    pub id: String,
    pub service: String,
    pub replica: u32,
    pub state: InstanceState,
    pub handle: Option<RuntimeHandle>,
    pub attachments: Vec<AttachmentHandle>,
    pub restarts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ServiceInstance {
    pub fn new(project: &str, service: &str, replica: u32) -> Self {
        Self {
            id: instance_id(project, service, replica),
            service: service.to_string(),
            replica,
            state: InstanceState::Pending,
            handle: None,
            attachments: Vec::new(),
            restarts: 0,
            started_at: None,
            last_error: None,
        }
    }

    pub fn status(&self) -> InstanceStatus {
        InstanceStatus {
            id: self.id.clone(),
            service: self.service.clone(),
            replica: self.replica,
            state: self.state,
            restarts: self.restarts,
            started_at: self.started_at,
            last_error: self.last_error.clone(),
        }
    }
}

/// Point-in-time view of an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub id: String,
    pub service: String,
    pub replica: u32,
    pub state: InstanceState,
    pub restarts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Instance id for a replica, `<project>-<service>-<replica>`
pub fn instance_id(project: &str, service: &str, replica: u32) -> String {
    format!("{}-{}-{}", project, service, replica)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classification() {
        assert!(InstanceState::Healthy.is_up());
        assert!(InstanceState::Unhealthy.is_up());
        assert!(!InstanceState::Starting.is_up());
        assert!(InstanceState::Starting.is_active());
        assert!(!InstanceState::Stopped.is_active());
        assert!(!InstanceState::Failed.is_active());
    }

    #[test]
    fn test_state_serializes_kebab_case() {
        let json = serde_json::to_string(&InstanceState::HealthChecking).unwrap();
        assert_eq!(json, "\"health-checking\"");
        assert_eq!(InstanceState::HealthChecking.to_string(), "health-checking");
    }

    #[test]
    fn test_instance_id() {
        let instance = ServiceInstance::new("shop", "web", 2);
        assert_eq!(instance.id, "shop-web-2");
        assert_eq!(instance.status().state, InstanceState::Pending);
    }
}
