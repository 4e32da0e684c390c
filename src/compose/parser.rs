//! Stack file parser

use super::config::ComposeConfig;
use super::convert::{into_stack, ConvertContext};
use crate::config::ProbeDefaults;
use crate::error::LoadError;
use crate::stack::Stack;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Default compose file names
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Project name used when neither the caller nor any file names one
const FALLBACK_PROJECT: &str = "default";

fn variable() -> &'static Regex {
    static VARIABLE: OnceLock<Regex> = OnceLock::new();
    VARIABLE.get_or_init(|| {
        Regex::new(r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?-)([^}]*))?\}|\$([A-Za-z_][A-Za-z0-9_]*)")
            .expect("variable pattern is valid")
    })
}

/// Stack file parser
pub struct ComposeParser {
    env: HashMap<String, String>,
    probe_defaults: ProbeDefaults,
    project: Option<String>,
}

impl ComposeParser {
    /// Create a parser interpolating from `env`
    pub fn new(env: HashMap<String, String>) -> Self {
        Self {
            env,
            probe_defaults: ProbeDefaults::default(),
            project: None,
        }
    }

    /// Create a parser interpolating from the process environment
    pub fn from_process_env() -> Self {
        Self::new(std::env::vars().collect())
    }

    /// Probe settings for healthchecks that leave them out
    pub fn probe_defaults(mut self, defaults: ProbeDefaults) -> Self {
        self.probe_defaults = defaults;
        self
    }

    /// Override the project name
    pub fn project(mut self, project: Option<String>) -> Self {
        self.project = project;
        self
    }

    /// Find compose file in directory
    pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
        DEFAULT_COMPOSE_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    /// Parse stack file text without converting it
    pub fn parse_str(&self, content: &str) -> Result<ComposeConfig, LoadError> {
        let content = self.interpolate(content);
        serde_yaml::from_str(&content)
            .map_err(|e| LoadError::Parse(format!("failed to parse YAML: {}", e)))
    }

    /// Parse a stack file from path
    pub fn parse_file(&self, path: &Path) -> Result<ComposeConfig, LoadError> {
        let content = std::fs::read_to_string(path).map_err(|e| LoadError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        self.parse_str(&content).map_err(|e| match e {
            LoadError::Parse(message) => {
                LoadError::Parse(format!("{}: {}", path.display(), message))
            }
            other => other,
        })
    }

    /// Load a stack from text, resolving relative paths against `base_dir`
    pub fn load_str(&self, content: &str, base_dir: &Path) -> Result<Stack, LoadError> {
        let config = self.parse_str(content)?;
        let project = self.project_name(std::slice::from_ref(&config), Some(base_dir));
        let stack = self.convert(&project, base_dir, config)?;
        self.finish(stack, project)
    }

    /// Load and layer stack files. A service declared in a later file
    /// replaces the earlier declaration wholesale.
    pub fn load_files(&self, paths: &[PathBuf]) -> Result<Stack, LoadError> {
        if paths.is_empty() {
            return Err(LoadError::Parse("no stack files given".to_string()));
        }

        let mut configs = Vec::with_capacity(paths.len());
        for path in paths {
            configs.push(self.parse_file(path)?);
        }

        let first_dir = base_dir(&paths[0]);
        let project = self.project_name(&configs, Some(&first_dir));

        let mut stack = Stack::new(&project);
        for (path, config) in paths.iter().zip(configs) {
            let layer = self.convert(&project, &base_dir(path), config)?;
            tracing::debug!(
                file = %path.display(),
                services = layer.services.len(),
                "loaded stack file"
            );
            stack = stack.overlay(layer);
        }
        self.finish(stack, project)
    }

    /// Find the default stack file in `dir` and load it
    pub fn load_dir(&self, dir: &Path) -> Result<Stack, LoadError> {
        let path = Self::find_compose_file(dir).ok_or_else(|| LoadError::Read {
            path: dir.to_path_buf(),
            message: format!("none of {} found", DEFAULT_COMPOSE_FILES.join(", ")),
        })?;
        self.load_files(&[path])
    }

    fn convert(
        &self,
        project: &str,
        base_dir: &Path,
        config: ComposeConfig,
    ) -> Result<Stack, LoadError> {
        let ctx = ConvertContext {
            project,
            base_dir,
            env: &self.env,
            probe_defaults: self.probe_defaults,
        };
        into_stack(&ctx, config)
    }

    /// Name the stack and validate its graph
    fn finish(&self, mut stack: Stack, project: String) -> Result<Stack, LoadError> {
        stack.name = project;
        stack.graph()?;
        Ok(stack)
    }

    /// Caller override, then the last file naming one, then the directory
    fn project_name(&self, configs: &[ComposeConfig], dir: Option<&Path>) -> String {
        if let Some(project) = &self.project {
            return project.clone();
        }
        if let Some(name) = configs.iter().rev().find_map(|c| c.name.clone()) {
            return name;
        }
        dir.and_then(|d| d.canonicalize().ok().or_else(|| Some(d.to_path_buf())))
            .and_then(|d| d.file_name().map(|n| n.to_string_lossy().to_lowercase()))
            .map(|name| {
                name.chars()
                    .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
                    .collect::<String>()
            })
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| FALLBACK_PROJECT.to_string())
    }

    /// Substitute `${VAR}`, `${VAR:-default}`, `${VAR-default}` and `$VAR`.
    /// `$$` is a literal dollar sign. Unset variables become empty.
    pub fn interpolate(&self, input: &str) -> String {
        variable()
            .replace_all(input, |caps: &Captures| {
                if &caps[0] == "$$" {
                    return "$".to_string();
                }
                let name = caps
                    .get(1)
                    .or_else(|| caps.get(4))
                    .map(|m| m.as_str())
                    .unwrap_or_default();
                let value = self.env.get(name);

                match (caps.get(2).map(|m| m.as_str()), value) {
                    (Some(":-"), Some(v)) if v.is_empty() => caps[3].to_string(),
                    (_, Some(v)) => v.clone(),
                    (Some(_), None) => caps[3].to_string(),
                    (None, None) => {
                        tracing::warn!("variable {} is not set, substituting an empty string", name);
                        String::new()
                    }
                }
            })
            .into_owned()
    }
}

fn base_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
