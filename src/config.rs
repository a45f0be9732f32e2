use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the controller
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Controller-wide settings
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Template backend settings
    #[serde(default)]
    pub template: TemplateConfig,

    /// Remote appliance backend settings
    #[serde(default)]
    pub appliance: ApplianceConfig,
}

/// Which backend the controller drives
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Template,
    Appliance,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ControllerConfig {
    /// Backend selected at startup (default: template)
    #[serde(default)]
    pub backend: BackendKind,

    /// Bind address of the admin API (default: 127.0.0.1)
    #[serde(default = "default_admin_bind")]
    pub admin_bind: String,

    /// Port of the admin API
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token required for event submission and state dumps.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Capacity of the event queue in front of the dispatcher
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            admin_bind: default_admin_bind(),
            admin_port: default_admin_port(),
            admin_token: None,
            queue_depth: default_queue_depth(),
            pid_file: None,
        }
    }
}

/// A template rendered on every commit
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct TemplateFile {
    /// Template source file
    pub source: PathBuf,
    /// Rendered config file, replaced atomically
    pub output: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TemplateConfig {
    /// Working directory for certificates and the routing snapshot
    #[serde(default = "default_template_dir")]
    pub dir: PathBuf,

    /// Executable run after the config files are written
    pub reload_script: Option<PathBuf>,

    /// Templates to render
    #[serde(default)]
    pub templates: Vec<TemplateFile>,

    /// PEM file served when no route certificate matches
    pub default_certificate: Option<PathBuf>,

    /// CA bundle used to verify reencrypted connections without a route-level CA
    pub default_destination_ca: Option<PathBuf>,

    #[serde(default)]
    pub stats_user: Option<String>,

    #[serde(default)]
    pub stats_password: Option<String>,

    /// Port of the proxy's stats page (0 disables it)
    #[serde(default)]
    pub stats_port: u16,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            dir: default_template_dir(),
            reload_script: None,
            templates: Vec::new(),
            default_certificate: None,
            default_destination_ca: None,
            stats_user: None,
            stats_password: None,
            stats_port: 0,
        }
    }
}

impl TemplateConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.templates.is_empty() {
            errors.push("template: at least one [[template.templates]] entry is required".to_string());
        }
        for (i, t) in self.templates.iter().enumerate() {
            if t.source.as_os_str().is_empty() || t.output.as_os_str().is_empty() {
                errors.push(format!("template: templates[{}] needs both 'source' and 'output'", i));
            }
        }
        if self.stats_port > 0 && (self.stats_user.is_none() || self.stats_password.is_none()) {
            errors.push("template: 'stats_user' and 'stats_password' are required when 'stats_port' is set".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApplianceConfig {
    /// Management host, with optional port
    #[serde(default)]
    pub host: String,

    /// Scheme of the management API (default: https)
    #[serde(default = "default_appliance_scheme")]
    pub scheme: String,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Virtual server receiving plain HTTP traffic
    pub http_vserver: Option<String>,

    /// Virtual server receiving TLS traffic
    pub https_vserver: Option<String>,

    /// Administrative partition holding every managed object (default: /Common)
    #[serde(default = "default_partition_path")]
    pub partition_path: String,

    /// Skip certificate verification of the management API
    #[serde(default)]
    pub insecure: bool,

    /// Timeout of a single management request in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ApplianceConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            scheme: default_appliance_scheme(),
            username: String::new(),
            password: String::new(),
            http_vserver: None,
            https_vserver: None,
            partition_path: default_partition_path(),
            insecure: false,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ApplianceConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.host)
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.host.is_empty() {
            errors.push("appliance: 'host' is required".to_string());
        }
        if self.username.is_empty() {
            errors.push("appliance: 'username' is required".to_string());
        }
        if self.scheme != "https" && self.scheme != "http" {
            errors.push(format!("appliance: unsupported scheme '{}'", self.scheme));
        }
        if !self.partition_path.starts_with('/') {
            errors.push(format!(
                "appliance: 'partition_path' must be absolute, got '{}'",
                self.partition_path
            ));
        }
        if self.request_timeout_secs == 0 {
            errors.push("appliance: 'request_timeout_secs' must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

// Default value functions
fn default_admin_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    9990
}

fn default_queue_depth() -> usize {
    256 // Events buffered before submitters wait
}

fn default_template_dir() -> PathBuf {
    PathBuf::from("/var/lib/routegate")
}

fn default_appliance_scheme() -> String {
    "https".to_string()
}

fn default_partition_path() -> String {
    "/Common".to_string()
}

fn default_request_timeout() -> u64 {
    30 // 30 seconds per management call
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the section of the selected backend
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.controller.queue_depth == 0 {
            errors.push("controller: 'queue_depth' must be greater than 0".to_string());
        }

        let backend = match self.controller.backend {
            BackendKind::Template => self.template.validate(),
            BackendKind::Appliance => self.appliance.validate(),
        };
        if let Err(e) = backend {
            errors.extend(e);
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
