//! Conversion of parsed stack files into the service model

use super::config::{
    BuildConfig, CommandConfig, ComposeConfig, DependsOnConfig, DeployConfig, EnvironmentConfig,
    HealthcheckConfig, HealthcheckTest, NetworksConfig, PortConfig, ServiceConfig, VolumeMount,
};
use super::duration::parse_duration;
use crate::config::ProbeDefaults;
use crate::error::LoadError;
use crate::stack::{
    Binding, Dependency, Gate, HealthProbe, ImageSource, PortBinding, Protocol, ResourceDecl,
    RestartPolicy, Service, Stack, VolumeBinding, VolumeSource,
};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Network every service may join without declaring it
pub const DEFAULT_NETWORK: &str = "default";

/// Inputs shared by every service of one stack file
pub struct ConvertContext<'a> {
    /// Project name, used to tag built images
    pub project: &'a str,
    /// Directory relative paths resolve against
    pub base_dir: &'a Path,
    /// Variables bare environment entries are taken from
    pub env: &'a HashMap<String, String>,
    pub probe_defaults: ProbeDefaults,
}

/// Convert one parsed file into a stack. Services keep name order; the
/// graph does not depend on it.
pub fn into_stack(ctx: &ConvertContext<'_>, config: ComposeConfig) -> Result<Stack, LoadError> {
    let mut stack = Stack::new(config.name.as_deref().unwrap_or_default());

    for (name, volume) in config.volumes {
        let volume = volume.unwrap_or_default();
        stack.volumes.insert(
            name,
            ResourceDecl {
                driver: volume.driver,
                external: volume.external.is_some_and(|e| e.is_external()),
            },
        );
    }
    for (name, network) in config.networks {
        let network = network.unwrap_or_default();
        stack.networks.insert(
            name,
            ResourceDecl {
                driver: network.driver,
                external: network.external.is_some_and(|e| e.is_external()),
            },
        );
    }

    let mut names: Vec<&String> = config.services.keys().collect();
    names.sort();
    for name in names {
        let service = convert_service(ctx, name, &config.services[name])?;
        check_resources(&mut stack, &service)?;
        stack.services.push(service);
    }

    Ok(stack)
}

/// Named volumes and networks must be declared at top level, except the
/// implicit default network
fn check_resources(stack: &mut Stack, service: &Service) -> Result<(), LoadError> {
    for volume in service.volumes() {
        if let VolumeSource::Named(name) = &volume.source {
            if !stack.volumes.contains_key(name) {
                return Err(invalid(
                    &service.name,
                    format!("refers to undefined volume '{}'", name),
                ));
            }
        }
    }
    let mut uses_default = false;
    for network in service.networks() {
        if network == DEFAULT_NETWORK {
            uses_default = true;
        } else if !stack.networks.contains_key(network) {
            return Err(invalid(
                &service.name,
                format!("refers to undefined network '{}'", network),
            ));
        }
    }
    if uses_default {
        stack
            .networks
            .entry(DEFAULT_NETWORK.to_string())
            .or_default();
    }
    Ok(())
}

fn convert_service(
    ctx: &ConvertContext<'_>,
    name: &str,
    config: &ServiceConfig,
) -> Result<Service, LoadError> {
    let image = image_source(ctx, name, config)?;
    let mut service = Service::with_source(name, image);

    service.command = config.command.as_ref().map(command_words);
    service.environment = environment(ctx.env, config.environment.as_ref());
    service.restart = restart_policy(name, config)?;
    service.replicas = replicas(name, config.replicas, config.deploy.as_ref())?;
    service.healthcheck = match &config.healthcheck {
        Some(healthcheck) => probe(name, healthcheck, ctx.probe_defaults)?,
        None => None,
    };
    service.depends_on = dependencies(name, config.depends_on.as_ref())?;

    for port in config.ports.iter().flatten() {
        let binding = parse_port(port).map_err(|reason| invalid(name, reason))?;
        service.bindings.push(Binding::Port(binding));
    }
    for mount in config.volumes.iter().flatten() {
        let binding = parse_volume(ctx.base_dir, mount).map_err(|reason| invalid(name, reason))?;
        service.bindings.push(Binding::Volume(binding));
    }
    match &config.networks {
        Some(NetworksConfig::Array(networks)) => {
            for network in networks {
                service.bindings.push(Binding::Network(network.clone()));
            }
        }
        Some(NetworksConfig::Map(networks)) => {
            let mut sorted: Vec<&String> = networks.keys().collect();
            sorted.sort();
            for network in sorted {
                service.bindings.push(Binding::Network(network.clone()));
            }
        }
        None => {}
    }

    Ok(service)
}

fn invalid(service: &str, reason: impl Into<String>) -> LoadError {
    LoadError::InvalidService {
        service: service.to_string(),
        reason: reason.into(),
    }
}

fn image_source(
    ctx: &ConvertContext<'_>,
    name: &str,
    config: &ServiceConfig,
) -> Result<ImageSource, LoadError> {
    let Some(build) = &config.build else {
        return config
            .image
            .clone()
            .map(ImageSource::Image)
            .ok_or_else(|| invalid(name, "must have either 'image' or 'build' specified"));
    };

    let (context, dockerfile, args) = match build {
        BuildConfig::Simple(context) => (context.clone(), None, BTreeMap::new()),
        BuildConfig::Full(full) => (
            full.context.clone().unwrap_or_else(|| ".".to_string()),
            full.dockerfile.clone(),
            full.args
                .clone()
                .unwrap_or_default()
                .into_iter()
                .collect(),
        ),
    };

    Ok(ImageSource::Build {
        context: resolve_path(ctx.base_dir, &context),
        dockerfile,
        args,
        tag: config
            .image
            .clone()
            .unwrap_or_else(|| format!("{}-{}", ctx.project, name)),
    })
}

fn command_words(command: &CommandConfig) -> Vec<String> {
    match command {
        CommandConfig::Shell(line) => line.split_whitespace().map(str::to_string).collect(),
        CommandConfig::Exec(words) => words.clone(),
    }
}

fn environment(
    host: &HashMap<String, String>,
    config: Option<&EnvironmentConfig>,
) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    match config {
        Some(EnvironmentConfig::Array(entries)) => {
            for entry in entries {
                match entry.split_once('=') {
                    Some((key, value)) => {
                        vars.insert(key.to_string(), value.to_string());
                    }
                    // A bare name passes the caller's value through
                    None => {
                        if let Some(value) = host.get(entry) {
                            vars.insert(entry.clone(), value.clone());
                        }
                    }
                }
            }
        }
        Some(EnvironmentConfig::Map(entries)) => {
            for (key, value) in entries {
                match value {
                    Some(value) => {
                        vars.insert(key.clone(), value.to_string());
                    }
                    None => {
                        if let Some(value) = host.get(key) {
                            vars.insert(key.clone(), value.clone());
                        }
                    }
                }
            }
        }
        None => {}
    }
    vars
}

/// `restart:` wins over `deploy.restart_policy`
fn restart_policy(name: &str, config: &ServiceConfig) -> Result<RestartPolicy, LoadError> {
    if let Some(restart) = &config.restart {
        return restart.parse().map_err(|e: String| invalid(name, e));
    }

    let Some(policy) = config.deploy.as_ref().and_then(|d| d.restart_policy.as_ref()) else {
        return Ok(RestartPolicy::Never);
    };
    match policy.condition.as_deref().unwrap_or("any") {
        "none" => Ok(RestartPolicy::Never),
        "on-failure" => Ok(RestartPolicy::OnFailure {
            max_retries: policy.max_attempts,
        }),
        "any" => Ok(RestartPolicy::Always),
        other => Err(invalid(
            name,
            format!("unknown restart_policy condition '{}'", other),
        )),
    }
}

fn replicas(
    name: &str,
    shorthand: Option<u32>,
    deploy: Option<&DeployConfig>,
) -> Result<u32, LoadError> {
    let replicas = deploy
        .and_then(|d| d.replicas)
        .or(shorthand)
        .unwrap_or(1);
    if replicas == 0 {
        return Err(invalid(name, "replicas must be at least 1"));
    }
    Ok(replicas)
}

fn probe(
    name: &str,
    config: &HealthcheckConfig,
    defaults: ProbeDefaults,
) -> Result<Option<HealthProbe>, LoadError> {
    if config.disable == Some(true) {
        return Ok(None);
    }

    let command = match &config.test {
        Some(HealthcheckTest::Command(line)) => shell(line),
        Some(HealthcheckTest::Array(words)) => match words.split_first() {
            Some((first, _)) if first == "NONE" => return Ok(None),
            Some((first, rest)) if first == "CMD" => rest.to_vec(),
            Some((first, rest)) if first == "CMD-SHELL" => shell(&rest.join(" ")),
            _ => words.clone(),
        },
        None => return Err(invalid(name, "healthcheck has no test")),
    };
    if command.is_empty() {
        return Err(invalid(name, "healthcheck test is empty"));
    }

    let duration = |field: &str, value: &Option<String>, default: Duration| match value {
        Some(text) => parse_duration(text)
            .map_err(|e| invalid(name, format!("healthcheck {}: {}", field, e))),
        None => Ok(default),
    };

    let retries = config.retries.unwrap_or(defaults.retries);
    if retries == 0 {
        return Err(invalid(name, "healthcheck retries must be at least 1"));
    }

    Ok(Some(
        HealthProbe::new(command)
            .interval(duration("interval", &config.interval, defaults.interval)?)
            .timeout(duration("timeout", &config.timeout, defaults.timeout)?)
            .retries(retries)
            .start_period(duration("start_period", &config.start_period, Duration::ZERO)?),
    ))
}

fn shell(line: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), line.to_string()]
}

fn dependencies(
    name: &str,
    config: Option<&DependsOnConfig>,
) -> Result<Vec<Dependency>, LoadError> {
    match config {
        None => Ok(Vec::new()),
        Some(DependsOnConfig::Array(services)) => Ok(services
            .iter()
            .map(|service| Dependency {
                service: service.clone(),
                gate: Gate::Started,
            })
            .collect()),
        Some(DependsOnConfig::Map(services)) => {
            let mut sorted: Vec<(&String, _)> = services.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            sorted
                .into_iter()
                .map(|(service, condition)| {
                    let gate = match condition.condition.as_deref() {
                        None | Some("service_started") => Gate::Started,
                        Some("service_healthy") => Gate::Healthy,
                        Some("service_completed_successfully") => {
                            return Err(invalid(
                                name,
                                format!(
                                    "condition service_completed_successfully on '{}' is not supported",
                                    service
                                ),
                            ))
                        }
                        Some(other) => {
                            return Err(invalid(
                                name,
                                format!("unknown depends_on condition '{}'", other),
                            ))
                        }
                    };
                    Ok(Dependency {
                        service: service.clone(),
                        gate,
                    })
                })
                .collect()
        }
    }
}

/// Parse `[ip:][host:]container[/protocol]` or the long form
pub fn parse_port(port: &PortConfig) -> Result<PortBinding, String> {
    match port {
        PortConfig::Number(container_port) => Ok(PortBinding {
            host_ip: None,
            host_port: None,
            container_port: *container_port,
            protocol: Protocol::Tcp,
        }),
        PortConfig::Long(long) => Ok(PortBinding {
            host_ip: long.host_ip.clone(),
            host_port: long.published,
            container_port: long.target,
            protocol: parse_protocol(long.protocol.as_deref().unwrap_or("tcp"))?,
        }),
        PortConfig::Short(spec) => {
            let (mapping, protocol) = match spec.rsplit_once('/') {
                Some((mapping, protocol)) => (mapping, parse_protocol(protocol)?),
                None => (spec.as_str(), Protocol::Tcp),
            };

            let number = |s: &str| -> Result<u16, String> {
                s.parse()
                    .map_err(|_| format!("invalid port '{}' in '{}'", s, spec))
            };

            let parts: Vec<&str> = mapping.split(':').collect();
            let (host_ip, host_port, container_port) = match parts.as_slice() {
                [container] => (None, None, number(container)?),
                [host, container] => (None, Some(number(host)?), number(container)?),
                [ip, host, container] => (
                    Some(ip.to_string()),
                    if host.is_empty() {
                        None
                    } else {
                        Some(number(host)?)
                    },
                    number(container)?,
                ),
                _ => return Err(format!("invalid port mapping '{}'", spec)),
            };

            Ok(PortBinding {
                host_ip,
                host_port,
                container_port,
                protocol,
            })
        }
    }
}

fn parse_protocol(protocol: &str) -> Result<Protocol, String> {
    match protocol {
        "tcp" => Ok(Protocol::Tcp),
        "udp" => Ok(Protocol::Udp),
        other => Err(format!("unsupported protocol '{}'", other)),
    }
}

/// Parse `[source:]target[:mode]` or the long form. Sources that look like
/// paths are bind mounts; anything else names a volume.
pub fn parse_volume(base_dir: &Path, mount: &VolumeMount) -> Result<VolumeBinding, String> {
    match mount {
        VolumeMount::Short(spec) => {
            let parts: Vec<&str> = spec.split(':').collect();
            let (source, target, mode) = match parts.as_slice() {
                [target] => (None, *target, None),
                [source, target] => (Some(*source), *target, None),
                [source, target, mode] => (Some(*source), *target, Some(*mode)),
                _ => return Err(format!("invalid volume mount '{}'", spec)),
            };
            if target.is_empty() {
                return Err(format!("volume mount '{}' has no target", spec));
            }

            let source = match source {
                None => VolumeSource::Anonymous,
                Some(source) if is_path(source) => VolumeSource::Host(resolve_path(base_dir, source)),
                Some(name) => VolumeSource::Named(name.to_string()),
            };
            let read_only = mode.is_some_and(|mode| mode.split(',').any(|opt| opt == "ro"));

            Ok(VolumeBinding {
                source,
                target: target.to_string(),
                read_only,
            })
        }
        VolumeMount::Long(long) => {
            let source = match (long.mount_type.as_deref(), long.source.as_deref()) {
                (Some("bind"), Some(path)) => VolumeSource::Host(resolve_path(base_dir, path)),
                (Some("bind"), None) => {
                    return Err(format!("bind mount at '{}' has no source", long.target))
                }
                (Some("volume"), Some(name)) => VolumeSource::Named(name.to_string()),
                (None, Some(path)) if is_path(path) => {
                    VolumeSource::Host(resolve_path(base_dir, path))
                }
                (None, Some(name)) => VolumeSource::Named(name.to_string()),
                (Some("volume") | Some("tmpfs") | None, None) => VolumeSource::Anonymous,
                (Some(other), _) => return Err(format!("unsupported mount type '{}'", other)),
            };
            Ok(VolumeBinding {
                source,
                target: long.target.clone(),
                read_only: long.read_only.unwrap_or(false),
            })
        }
    }
}

fn is_path(source: &str) -> bool {
    source.starts_with('.') || source.starts_with('/') || source.starts_with('~')
}

fn resolve_path(base_dir: &Path, path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::config::PortConfigLong;

    fn convert(yaml: &str) -> Result<Stack, LoadError> {
        let config: ComposeConfig = serde_yaml::from_str(yaml).unwrap();
        let env = HashMap::from([("PGPASS".to_string(), "hunter2".to_string())]);
        let ctx = ConvertContext {
            project: "shop",
            base_dir: Path::new("/srv/shop"),
            env: &env,
            probe_defaults: ProbeDefaults::default(),
        };
        into_stack(&ctx, config)
    }

    #[test]
    fn test_converts_full_service() {
        let stack = convert(
            r#"
name: shop
services:
  db:
    image: postgres:16
    environment:
      POSTGRES_DB: shop
      PGPASS:
      MAX_CONN: 100
    volumes: ["pgdata:/var/lib/postgresql/data", "./init:/docker-entrypoint-initdb.d:ro"]
    networks: [backend]
    healthcheck:
      test: ["CMD", "pg_isready", "-U", "postgres"]
      interval: 5s
      timeout: 3s
      retries: 5
      start_period: 1s
    restart: on-failure:3
  web:
    build: ./web
    ports: ["8080:80", "127.0.0.1:9090:90/udp"]
    networks: [backend]
    depends_on:
      db: { condition: service_healthy }
    deploy: { replicas: 2 }
volumes: { pgdata: {} }
networks: { backend: { driver: bridge } }
"#,
        )
        .unwrap();

        assert_eq!(stack.name, "shop");
        assert_eq!(stack.networks["backend"].driver.as_deref(), Some("bridge"));

        let db = stack.get("db").unwrap();
        assert_eq!(db.environment["POSTGRES_DB"], "shop");
        assert_eq!(db.environment["PGPASS"], "hunter2");
        assert_eq!(db.environment["MAX_CONN"], "100");
        assert_eq!(
            db.restart,
            RestartPolicy::OnFailure {
                max_retries: Some(3)
            }
        );
        let probe = db.healthcheck.as_ref().unwrap();
        assert_eq!(probe.command, vec!["pg_isready", "-U", "postgres"]);
        assert_eq!(probe.interval, Duration::from_secs(5));
        assert_eq!(probe.retries, 5);
        assert_eq!(probe.start_period, Duration::from_secs(1));

        let mounts: Vec<&VolumeBinding> = db.volumes().collect();
        assert_eq!(mounts[0].source, VolumeSource::Named("pgdata".into()));
        assert_eq!(
            mounts[1].source,
            VolumeSource::Host(PathBuf::from("/srv/shop/init"))
        );
        assert!(mounts[1].read_only);

        let web = stack.get("web").unwrap();
        assert_eq!(web.replicas, 2);
        assert_eq!(web.gate_on("db"), Some(Gate::Healthy));
        match &web.image {
            ImageSource::Build { context, tag, .. } => {
                assert_eq!(context, &PathBuf::from("/srv/shop/web"));
                assert_eq!(tag, "shop-web");
            }
            other => panic!("expected a build, got {:?}", other),
        }
        let ports: Vec<&PortBinding> = web.ports().collect();
        assert_eq!(ports[0].host_port, Some(8080));
        assert_eq!(ports[1].host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(ports[1].protocol, Protocol::Udp);
    }

    #[test]
    fn test_list_depends_on_is_a_started_gate() {
        let stack = convert(
            r#"
services:
  cache: { image: redis }
  web:
    image: nginx
    depends_on: [cache]
"#,
        )
        .unwrap();
        assert_eq!(stack.get("web").unwrap().gate_on("cache"), Some(Gate::Started));
    }

    #[test]
    fn test_completed_successfully_is_rejected() {
        let err = convert(
            r#"
services:
  migrate: { image: shop-migrate }
  web:
    image: nginx
    depends_on:
      migrate: { condition: service_completed_successfully }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, LoadError::InvalidService { ref service, .. } if service == "web"));
    }

    #[test]
    fn test_healthcheck_forms() {
        let stack = convert(
            r#"
services:
  a:
    image: x
    healthcheck: { test: "curl -f localhost" }
  b:
    image: x
    healthcheck: { test: ["CMD-SHELL", "curl -f localhost || exit 1"] }
  c:
    image: x
    healthcheck: { test: ["NONE"] }
  d:
    image: x
    healthcheck: { test: ["CMD", "true"], disable: true }
"#,
        )
        .unwrap();

        let a = stack.get("a").unwrap().healthcheck.as_ref().unwrap();
        assert_eq!(a.command, vec!["sh", "-c", "curl -f localhost"]);
        assert_eq!(a.interval, Duration::from_secs(30));
        let b = stack.get("b").unwrap().healthcheck.as_ref().unwrap();
        assert_eq!(b.command[2], "curl -f localhost || exit 1");
        assert!(stack.get("c").unwrap().healthcheck.is_none());
        assert!(stack.get("d").unwrap().healthcheck.is_none());
    }

    #[test]
    fn test_service_without_image_or_build_is_rejected() {
        assert!(matches!(
            convert("services:\n  web:\n    ports: [\"80:80\"]\n"),
            Err(LoadError::InvalidService { .. })
        ));
    }

    #[test]
    fn test_undefined_volume_is_rejected_and_default_network_is_implicit() {
        assert!(matches!(
            convert("services:\n  db:\n    image: pg\n    volumes: [\"data:/d\"]\n"),
            Err(LoadError::InvalidService { .. })
        ));

        let stack = convert("services:\n  db:\n    image: pg\n    networks: [default]\n").unwrap();
        assert!(stack.networks.contains_key(DEFAULT_NETWORK));
    }

    #[test]
    fn test_huge_healthcheck_interval_is_a_load_error() {
        let err = convert(
            r#"
services:
  db:
    image: pg
    healthcheck: { test: ["CMD", "true"], interval: 99999999999999999999h }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, LoadError::InvalidService { ref service, .. } if service == "db"));
    }

    #[test]
    fn test_zero_replicas_is_rejected() {
        assert!(convert("services:\n  web:\n    image: nginx\n    replicas: 0\n").is_err());
    }

    #[test]
    fn test_parse_port_forms() {
        let port = parse_port(&PortConfig::Short("127.0.0.1::80".into())).unwrap();
        assert_eq!(port.host_port, None);
        assert_eq!(port.container_port, 80);

        let port = parse_port(&PortConfig::Long(PortConfigLong {
            target: 443,
            published: Some(8443),
            host_ip: None,
            protocol: None,
        }))
        .unwrap();
        assert_eq!(port.host_port, Some(8443));

        assert!(parse_port(&PortConfig::Short("8000-8010:80".into())).is_err());
        assert!(parse_port(&PortConfig::Short("80/sctp".into())).is_err());
    }

    #[test]
    fn test_parse_anonymous_volume() {
        let mount = parse_volume(Path::new("/"), &VolumeMount::Short("/var/cache".into())).unwrap();
        assert_eq!(mount.source, VolumeSource::Anonymous);
        assert_eq!(mount.target, "/var/cache");
    }
}
