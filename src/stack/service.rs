//! Service model

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Condition a dependency must satisfy before its dependent may start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gate {
    /// The runtime reports at least one instance running
    Started,
    /// The health monitor resolved every instance as healthy
    Healthy,
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gate::Started => write!(f, "started"),
            Gate::Healthy => write!(f, "healthy"),
        }
    }
}

/// A declared dependency on another service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub service: String,
    pub gate: Gate,
}

/// Restart policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// A failed start is fatal to the operation
    #[default]
    Never,
    /// Retry a failed start up to `max_retries` times
    OnFailure { max_retries: Option<u32> },
    /// Retry indefinitely
    Always,
}

impl FromStr for RestartPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "no" | "never" | "none" => Ok(RestartPolicy::Never),
            "always" | "unless-stopped" | "any" => Ok(RestartPolicy::Always),
            "on-failure" => Ok(RestartPolicy::OnFailure { max_retries: None }),
            other => match other.strip_prefix("on-failure:") {
                Some(count) => count
                    .parse()
                    .map(|n| RestartPolicy::OnFailure {
                        max_retries: Some(n),
                    })
                    .map_err(|_| format!("invalid retry count in restart policy '{}'", s)),
                None => Err(format!("unknown restart policy '{}'", s)),
            },
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPolicy::Never => write!(f, "never"),
            RestartPolicy::OnFailure { max_retries: None } => write!(f, "on-failure"),
            RestartPolicy::OnFailure {
                max_retries: Some(n),
            } => write!(f, "on-failure:{}", n),
            RestartPolicy::Always => write!(f, "always"),
        }
    }
}

/// Health probe configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthProbe {
    /// Command executed inside the instance; exit code 0 is a pass
    pub command: Vec<String>,
    /// Delay between the end of one check and the start of the next
    pub interval: Duration,
    /// A check running longer than this counts as a failure
    pub timeout: Duration,
    /// Consecutive failures that mark the instance unhealthy
    pub retries: u32,
    /// Grace period before the first check
    pub start_period: Duration,
}

impl HealthProbe {
    /// Create a probe with compose defaults (30s interval, 30s timeout, 3 retries)
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(30),
            retries: 3,
            start_period: Duration::ZERO,
        }
    }

    /// Set interval
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set retries
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Set start period
    pub fn start_period(mut self, start_period: Duration) -> Self {
        self.start_period = start_period;
        self
    }
}

/// Where a service's image comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSource {
    /// Pull a named image
    Image(String),
    /// Build from a context directory and tag the result
    Build {
        context: PathBuf,
        dockerfile: Option<String>,
        args: BTreeMap<String, String>,
        tag: String,
    },
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Image(reference) => write!(f, "{}", reference),
            ImageSource::Build { context, tag, .. } => {
                write!(f, "{} (built from {})", tag, context.display())
            }
        }
    }
}

/// Network protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// Port binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    pub host_ip: Option<String>,
    pub host_port: Option<u16>,
    pub container_port: u16,
    pub protocol: Protocol,
}

/// Source of a volume mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeSource {
    /// A named volume managed by the resource registry
    Named(String),
    /// A host path bind mount
    Host(PathBuf),
    /// An anonymous volume owned by the instance
    Anonymous,
}

/// Volume binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBinding {
    pub source: VolumeSource,
    pub target: String,
    pub read_only: bool,
}

/// A port, volume or network binding, in declaration order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Binding {
    Port(PortBinding),
    Volume(VolumeBinding),
    Network(String),
}

/// A declared unit of deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub image: ImageSource,
    pub command: Option<Vec<String>>,
    pub bindings: Vec<Binding>,
    pub environment: BTreeMap<String, String>,
    pub restart: RestartPolicy,
    pub healthcheck: Option<HealthProbe>,
    pub depends_on: Vec<Dependency>,
    pub replicas: u32,
}

impl Service {
    /// Create a service running a named image
    pub fn new(name: &str, image: &str) -> Self {
        Self::with_source(name, ImageSource::Image(image.to_string()))
    }

    /// Create a service from an image source
    pub fn with_source(name: &str, image: ImageSource) -> Self {
        Self {
            name: name.to_string(),
            image,
            command: None,
            bindings: Vec::new(),
            environment: BTreeMap::new(),
            restart: RestartPolicy::Never,
            healthcheck: None,
            depends_on: Vec::new(),
            replicas: 1,
        }
    }

    /// Add a dependency
    pub fn depends_on(mut self, service: &str, gate: Gate) -> Self {
        self.depends_on.push(Dependency {
            service: service.to_string(),
            gate,
        });
        self
    }

    /// Set health probe
    pub fn healthcheck(mut self, probe: HealthProbe) -> Self {
        self.healthcheck = Some(probe);
        self
    }

    /// Set replica count
    pub fn replicas(mut self, replicas: u32) -> Self {
        self.replicas = replicas;
        self
    }

    /// Set restart policy
    pub fn restart(mut self, policy: RestartPolicy) -> Self {
        self.restart = policy;
        self
    }

    /// Set command
    pub fn command(mut self, command: Vec<String>) -> Self {
        self.command = Some(command);
        self
    }

    /// Add environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.environment.insert(key.to_string(), value.to_string());
        self
    }

    /// Mount a named volume
    pub fn volume(mut self, name: &str, target: &str) -> Self {
        self.bindings.push(Binding::Volume(VolumeBinding {
            source: VolumeSource::Named(name.to_string()),
            target: target.to_string(),
            read_only: false,
        }));
        self
    }

    /// Join a network
    pub fn network(mut self, name: &str) -> Self {
        self.bindings.push(Binding::Network(name.to_string()));
        self
    }

    /// Publish a port
    pub fn port(mut self, host_port: u16, container_port: u16) -> Self {
        self.bindings.push(Binding::Port(PortBinding {
            host_ip: None,
            host_port: Some(host_port),
            container_port,
            protocol: Protocol::Tcp,
        }));
        self
    }

    /// Port bindings in declaration order
    pub fn ports(&self) -> impl Iterator<Item = &PortBinding> {
        self.bindings.iter().filter_map(|b| match b {
            Binding::Port(p) => Some(p),
            _ => None,
        })
    }

    /// Volume bindings in declaration order
    pub fn volumes(&self) -> impl Iterator<Item = &VolumeBinding> {
        self.bindings.iter().filter_map(|b| match b {
            Binding::Volume(v) => Some(v),
            _ => None,
        })
    }

    /// Network names in declaration order
    pub fn networks(&self) -> impl Iterator<Item = &str> {
        self.bindings.iter().filter_map(|b| match b {
            Binding::Network(n) => Some(n.as_str()),
            _ => None,
        })
    }

    /// Gate this service declares on `target`, if any
    pub fn gate_on(&self, target: &str) -> Option<Gate> {
        self.depends_on
            .iter()
            .find(|d| d.service == target)
            .map(|d| d.gate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_restart_policy() {
        assert_eq!("no".parse::<RestartPolicy>().unwrap(), RestartPolicy::Never);
        assert_eq!(
            "always".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::Always
        );
        assert_eq!(
            "on-failure".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::OnFailure { max_retries: None }
        );
        assert_eq!(
            "on-failure:5".parse::<RestartPolicy>().unwrap(),
            RestartPolicy::OnFailure {
                max_retries: Some(5)
            }
        );
        assert!("on-failure:x".parse::<RestartPolicy>().is_err());
        assert!("sometimes".parse::<RestartPolicy>().is_err());
    }

    #[test]
    fn test_restart_policy_display_round_trips() {
        let policy = RestartPolicy::OnFailure {
            max_retries: Some(2),
        };
        assert_eq!(policy.to_string().parse::<RestartPolicy>().unwrap(), policy);
    }

    #[test]
    fn test_bindings_keep_declaration_order() {
        let service = Service::new("web", "nginx")
            .port(8080, 80)
            .network("front")
            .volume("static", "/srv")
            .network("back");

        let networks: Vec<&str> = service.networks().collect();
        assert_eq!(networks, vec!["front", "back"]);
        assert_eq!(service.ports().count(), 1);
        assert_eq!(service.volumes().count(), 1);
        assert!(matches!(service.bindings[2], Binding::Volume(_)));
    }

    #[test]
    fn test_gate_on() {
        let service = Service::new("web", "nginx")
            .depends_on("db", Gate::Healthy)
            .depends_on("cache", Gate::Started);

        assert_eq!(service.gate_on("db"), Some(Gate::Healthy));
        assert_eq!(service.gate_on("cache"), Some(Gate::Started));
        assert_eq!(service.gate_on("queue"), None);
    }
}
