//! Error types for runestack

use crate::resource::ResourceKind;
use crate::stack::Gate;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Errors raised while loading a stack definition.
///
/// Every variant is fatal: a stack that fails to load never starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("dependency cycle detected: {}", participants.join(" -> "))]
    CycleDetected { participants: Vec<String> },

    #[error("service '{service}' depends on unknown service '{target}'")]
    UnknownDependency { service: String, target: String },

    #[error("service '{service}' waits for '{target}' to be healthy but '{target}' has no healthcheck")]
    HealthGateWithoutProbe { service: String, target: String },

    #[error("service '{0}' is declared more than once")]
    DuplicateService(String),

    #[error("invalid service '{service}': {reason}")]
    InvalidService { service: String, reason: String },

    #[error("failed to parse stack definition: {0}")]
    Parse(String),

    #[error("failed to read {}: {message}", path.display())]
    Read { path: PathBuf, message: String },
}

/// Errors reported by the image provider and runtime driver
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("image error: {0}")]
    Image(String),

    #[error("build error: {0}")]
    Build(String),

    #[error("start refused: {0}")]
    Start(String),

    #[error("stop failed: {0}")]
    Stop(String),

    #[error("probe error: {0}")]
    Probe(String),

    #[error("volume error: {0}")]
    Volume(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("unknown runtime handle: {0}")]
    UnknownHandle(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors raised by the resource registry
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("failed to create {kind} '{name}': {source}")]
    Create {
        name: String,
        kind: ResourceKind,
        source: DriverError,
    },

    #[error("failed to remove {kind} '{name}': {source}")]
    Remove {
        name: String,
        kind: ResourceKind,
        source: DriverError,
    },

    #[error("instance '{instance}' is not attached to {kind} '{name}'")]
    NotAttached {
        name: String,
        kind: ResourceKind,
        instance: String,
    },
}

/// Why a service did not reach its target state
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    #[error("image unavailable: {0}")]
    Image(DriverError),

    #[error("start failed after {attempts} attempt(s): {error}")]
    Start { attempts: u32, error: DriverError },

    #[error("resource unavailable: {0}")]
    Resource(ResourceError),

    #[error("unhealthy after {checks} check(s): {last_error}")]
    Unhealthy { checks: u32, last_error: String },

    #[error("dependency '{dependency}' never became {gate}")]
    Blocked { dependency: String, gate: Gate },

    #[error("stop failed: {0}")]
    Stop(DriverError),

    #[error("not started because the operation was aborted")]
    Aborted,
}

/// A failure attributed to one service, and to one instance when known
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFailure {
    pub service: String,
    pub replica: Option<u32>,
    pub cause: FailureCause,
}

impl ServiceFailure {
    pub fn service(service: &str, cause: FailureCause) -> Self {
        Self {
            service: service.to_string(),
            replica: None,
            cause,
        }
    }

    pub fn instance(service: &str, replica: u32, cause: FailureCause) -> Self {
        Self {
            service: service.to_string(),
            replica: Some(replica),
            cause,
        }
    }
}

impl fmt::Display for ServiceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.replica {
            Some(replica) => write!(f, "{}[{}]: {}", self.service, replica, self.cause),
            None => write!(f, "{}: {}", self.service, self.cause),
        }
    }
}

/// Structured failure of an `up`, `down` or `scale` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFailure {
    pub failures: Vec<ServiceFailure>,
    /// Whether instances started by the failed call were stopped again
    pub rolled_back: bool,
}

impl StackFailure {
    /// Failures recorded for one service
    pub fn for_service<'a>(&'a self, service: &'a str) -> impl Iterator<Item = &'a ServiceFailure> {
        self.failures.iter().filter(move |f| f.service == service)
    }

    /// Whether the named service is listed as failed
    pub fn contains(&self, service: &str) -> bool {
        self.for_service(service).next().is_some()
    }
}

impl fmt::Display for StackFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} service failure(s)",
            self.failures.len()
        )?;
        if self.rolled_back {
            write!(f, " (rolled back)")?;
        }
        for failure in &self.failures {
            write!(f, "; {}", failure)?;
        }
        Ok(())
    }
}

/// Orchestration error types
#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("stack failed to start: {0}")]
    Up(StackFailure),

    #[error("stack failed to stop: {0}")]
    Down(StackFailure),

    #[error("scale failed: {0}")]
    Scale(StackFailure),

    #[error("operation cancelled")]
    Cancelled,

    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("cannot scale '{service}': dependency '{dependency}' is not {gate}")]
    GateNotSatisfied {
        service: String,
        dependency: String,
        gate: Gate,
    },

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl OrchestrationError {
    /// The structured failure carried by `up`, `down` and `scale` errors
    pub fn stack_failure(&self) -> Option<&StackFailure> {
        match self {
            Self::Up(f) | Self::Down(f) | Self::Scale(f) => Some(f),
            _ => None,
        }
    }
}
