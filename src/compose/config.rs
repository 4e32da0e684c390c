//! Stack file types
//!
//! The compose-style YAML shapes accepted by the loader. Anything not listed
//! here is ignored on parse.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Stack file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// Project name
    #[serde(default)]
    pub name: Option<String>,
    /// Services
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
    /// Networks
    #[serde(default)]
    pub networks: HashMap<String, Option<NetworkConfig>>,
    /// Volumes
    #[serde(default)]
    pub volumes: HashMap<String, Option<VolumeConfig>>,
}

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Image name
    #[serde(default)]
    pub image: Option<String>,
    /// Build configuration
    #[serde(default)]
    pub build: Option<BuildConfig>,
    /// Command to run
    #[serde(default)]
    pub command: Option<CommandConfig>,
    /// Environment variables
    #[serde(default)]
    pub environment: Option<EnvironmentConfig>,
    /// Port mappings
    #[serde(default)]
    pub ports: Option<Vec<PortConfig>>,
    /// Volume mounts
    #[serde(default)]
    pub volumes: Option<Vec<VolumeMount>>,
    /// Networks to connect to
    #[serde(default)]
    pub networks: Option<NetworksConfig>,
    /// Service dependencies
    #[serde(default)]
    pub depends_on: Option<DependsOnConfig>,
    /// Deploy configuration
    #[serde(default)]
    pub deploy: Option<DeployConfig>,
    /// Healthcheck configuration
    #[serde(default)]
    pub healthcheck: Option<HealthcheckConfig>,
    /// Restart policy
    #[serde(default)]
    pub restart: Option<String>,
    /// Replica count, shorthand for `deploy.replicas`
    #[serde(default, alias = "scale")]
    pub replicas: Option<u32>,
}

/// Build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildConfig {
    /// Context path
    Simple(String),
    /// Full build configuration
    Full(BuildConfigFull),
}

/// Full build configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConfigFull {
    /// Build context
    pub context: Option<String>,
    /// Dockerfile path
    pub dockerfile: Option<String>,
    /// Build arguments
    #[serde(default)]
    pub args: Option<HashMap<String, String>>,
}

/// Command configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    /// Shell command string
    Shell(String),
    /// Exec form array
    Exec(Vec<String>),
}

/// Environment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    /// Array of KEY=value strings
    Array(Vec<String>),
    /// Map of key to value
    Map(HashMap<String, Option<EnvValue>>),
}

/// Scalar environment value; YAML numbers and booleans are accepted as-is
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl std::fmt::Display for EnvValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvValue::Text(s) => write!(f, "{}", s),
            EnvValue::Integer(n) => write!(f, "{}", n),
            EnvValue::Float(n) => write!(f, "{}", n),
            EnvValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Port configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    /// Bare container port
    Number(u16),
    /// Short syntax: "8080:80"
    Short(String),
    /// Long syntax
    Long(PortConfigLong),
}

/// Long port configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortConfigLong {
    /// Target port in container
    pub target: u16,
    /// Published port on host
    pub published: Option<u16>,
    /// Host IP to bind to
    pub host_ip: Option<String>,
    /// Protocol (tcp/udp)
    pub protocol: Option<String>,
}

/// Volume mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VolumeMount {
    /// Short syntax: "source:target:mode"
    Short(String),
    /// Long syntax
    Long(VolumeMountLong),
}

/// Long volume mount configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeMountLong {
    /// Mount type (volume, bind)
    #[serde(rename = "type")]
    pub mount_type: Option<String>,
    /// Source path or volume name
    pub source: Option<String>,
    /// Target path in container
    pub target: String,
    /// Read only
    pub read_only: Option<bool>,
}

/// Networks configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetworksConfig {
    /// Array of network names
    Array(Vec<String>),
    /// Map of network name to per-service settings, which are ignored
    Map(HashMap<String, Option<serde_yaml::Value>>),
}

/// Depends on configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOnConfig {
    /// Array of service names
    Array(Vec<String>),
    /// Map of service to condition
    Map(HashMap<String, DependsOnCondition>),
}

/// Depends on condition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependsOnCondition {
    /// Condition to wait for; `service_started` when omitted
    #[serde(default)]
    pub condition: Option<String>,
}

/// Deploy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Number of replicas
    pub replicas: Option<u32>,
    /// Restart policy
    pub restart_policy: Option<RestartPolicyConfig>,
}

/// Restart policy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestartPolicyConfig {
    /// Condition (none, on-failure, any)
    pub condition: Option<String>,
    /// Maximum attempts
    pub max_attempts: Option<u32>,
}

/// Healthcheck configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    /// Test command
    pub test: Option<HealthcheckTest>,
    /// Interval
    pub interval: Option<String>,
    /// Timeout
    pub timeout: Option<String>,
    /// Retries
    pub retries: Option<u32>,
    /// Start period
    pub start_period: Option<String>,
    /// Disable healthcheck
    pub disable: Option<bool>,
}

/// Healthcheck test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HealthcheckTest {
    /// Command string, run through a shell
    Command(String),
    /// Command array, optionally prefixed by CMD, CMD-SHELL or NONE
    Array(Vec<String>),
}

/// Network configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Driver
    pub driver: Option<String>,
    /// External network
    pub external: Option<ExternalConfig>,
}

/// Volume configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Driver
    pub driver: Option<String>,
    /// External volume
    pub external: Option<ExternalConfig>,
}

/// External resource configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExternalConfig {
    /// Boolean
    Bool(bool),
    /// With name
    Named { name: String },
}

impl ExternalConfig {
    pub fn is_external(&self) -> bool {
        match self {
            ExternalConfig::Bool(b) => *b,
            ExternalConfig::Named { .. } => true,
        }
    }
}
