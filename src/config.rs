//! Manifest loading, defaulting and validation

use crate::error::{Error, Result};
use crate::routes::is_valid_hostname;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// First local port handed out to services that don't set one
pub const BASE_LOCAL_PORT: u16 = 1500;

/// Manifest file names tried in the working directory, in order
const LOCAL_MANIFEST_NAMES: &[&str] = &["proxy.yaml", "proxy.yml"];

/// Manifest file names tried in the home directory, in order
const HOME_MANIFEST_NAMES: &[&str] = &["proxy.yaml", ".proxy.yaml", "proxy.yml", ".proxy.yml"];

/// The proxy manifest
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Listen address for the proxy (default: 127.0.0.1:80)
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Skip certificate verification for https upstreams
    #[serde(default)]
    pub insecure: bool,

    /// Max time to wait for an upstream response head, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Listener TLS settings
    #[serde(default)]
    pub tls: TlsConfig,

    /// Forwarding channel startup and teardown settings
    #[serde(default)]
    pub startup: StartupConfig,

    /// Services to forward, in manifest order
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TlsConfig {
    /// Serve HTTPS instead of HTTP
    #[serde(default)]
    pub enabled: bool,

    /// Path to the certificate chain (PEM). Omit with `key` to self-sign.
    pub cert: Option<String>,

    /// Path to the private key (PEM)
    pub key: Option<String>,
}

/// How to decide forwarding channels are ready before serving
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Readiness {
    /// Sleep a fixed delay (default)
    #[default]
    Settle,
    /// Poll each local port until it accepts connections
    Probe,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StartupConfig {
    #[serde(default)]
    pub readiness: Readiness,

    /// Fixed delay used by `settle` readiness, in milliseconds
    #[serde(default = "default_settle_delay")]
    pub settle_delay_ms: u64,

    /// Upper bound for `probe` readiness, in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL for forwarding processes
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Program used to establish forwarding channels
    #[serde(default = "default_kubectl")]
    pub kubectl: String,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            readiness: Readiness::default(),
            settle_delay_ms: default_settle_delay(),
            probe_timeout_secs: default_probe_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            kubectl: default_kubectl(),
        }
    }
}

impl StartupConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

/// One backend service reachable through a forwarding channel
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    /// Hostname requests are routed by
    #[serde(alias = "hostname")]
    pub name: String,

    /// Remote target, e.g. `svc/api` or `pod/worker-0`
    #[serde(default)]
    pub target: String,

    #[serde(default)]
    pub namespace: String,

    /// `http` or `https`
    #[serde(default)]
    pub protocol: String,

    /// Host the local end of the channel is reached on
    #[serde(default)]
    pub host: String,

    /// Remote port
    #[serde(default)]
    pub port: u16,

    /// Local port the channel binds (0 = allocate)
    #[serde(default, alias = "localport", alias = "localPort")]
    pub local_port: u16,
}

impl ServiceSpec {
    /// Create a service with only the required fields set
    pub fn new(name: &str, target: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            target: target.to_string(),
            namespace: String::new(),
            protocol: String::new(),
            host: String::new(),
            port,
            local_port: 0,
        }
    }

    /// Fill in unset fields. `index` is the position in the manifest.
    pub fn apply_defaults(&mut self, index: usize) {
        if !self.name.contains('.') {
            self.name.push_str(".local");
        }
        if self.namespace.is_empty() {
            self.namespace = "default".to_string();
        }
        if self.local_port == 0 {
            // Sequential allocation; collides with explicit ports in the same range.
            self.local_port = u16::try_from(index)
                .ok()
                .and_then(|i| BASE_LOCAL_PORT.checked_add(i))
                .unwrap_or(0);
        }
        if self.protocol.is_empty() {
            self.protocol = "http".to_string();
        }
        if self.host.is_empty() {
            self.host = "127.0.0.1".to_string();
        }
    }

    /// Address the local end of the forwarding channel listens on
    pub fn local_authority(&self) -> String {
        format!("{}:{}", self.host, self.local_port)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.name.trim_end_matches(".local").is_empty() {
            return Err("service 'name' must not be empty".to_string());
        }
        if !is_valid_hostname(&self.name) {
            return Err(format!(
                "Service '{}': name may only contain letters, digits, '-' and '.'",
                self.name
            ));
        }
        if self.target.is_empty() {
            return Err(format!("Service '{}': 'target' is required", self.name));
        }
        if self.port == 0 {
            return Err(format!("Service '{}': 'port' must be greater than 0", self.name));
        }
        if self.local_port == 0 {
            return Err(format!("Service '{}': no local port available", self.name));
        }
        if self.protocol != "http" && self.protocol != "https" {
            return Err(format!(
                "Service '{}': unsupported protocol '{}' (expected http or https)",
                self.name, self.protocol
            ));
        }
        Ok(())
    }
}

fn default_listen() -> String {
    "127.0.0.1:80".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_settle_delay() -> u64 {
    1000 // kubectl usually binds its port well within a second
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

impl Config {
    /// Read, default and validate a manifest. `.toml` files are parsed as
    /// TOML, everything else as YAML.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;

        let is_toml = path.extension().is_some_and(|ext| ext == "toml");
        if is_toml {
            Self::from_toml(&content)
        } else {
            Self::from_yaml(&content)
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = if content.trim().is_empty() {
            serde_yaml::from_str("{}")
        } else {
            serde_yaml::from_str(content)
        }
        .map_err(|e| Error::config(format!("invalid manifest: {}", e)))?;
        config.finish()
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| Error::config(format!("invalid manifest: {}", e)))?;
        config.finish()
    }

    fn finish(mut self) -> Result<Self> {
        self.apply_defaults();
        self.validate()?;
        Ok(self)
    }

    pub fn apply_defaults(&mut self) {
        for (index, service) in self.services.iter_mut().enumerate() {
            service.apply_defaults(index);
        }
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = parse_listen(&self.listen) {
            errors.push(e);
        }

        if self.tls.cert.is_some() != self.tls.key.is_some() {
            errors.push("tls 'cert' and 'key' must be set together".to_string());
        }

        for service in &self.services {
            if let Err(e) = service.validate() {
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            return Err(Error::config(format!(
                "Configuration errors:\n  - {}",
                errors.join("\n  - ")
            )));
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        parse_listen(&self.listen).map_err(Error::config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Parse a listen address. A bare `:port` binds all interfaces.
pub fn parse_listen(listen: &str) -> std::result::Result<SocketAddr, String> {
    let full = if listen.starts_with(':') {
        format!("0.0.0.0{}", listen)
    } else {
        listen.to_string()
    };
    full.parse()
        .map_err(|e| format!("invalid listen address '{}': {}", listen, e))
}

/// Candidate manifest locations, in search order
pub fn manifest_candidates(cwd: &Path, home: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = LOCAL_MANIFEST_NAMES.iter().map(|name| cwd.join(name)).collect();
    if let Some(home) = home {
        candidates.extend(HOME_MANIFEST_NAMES.iter().map(|name| home.join(name)));
    }
    candidates
}

/// Resolve the manifest path: the explicit argument if given, otherwise the
/// first existing default location.
pub fn locate_manifest(explicit: Option<PathBuf>, cwd: &Path, home: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }

    manifest_candidates(cwd, home)
        .into_iter()
        .find(|path| path.is_file())
        .ok_or_else(|| Error::config("manifest file is not defined and no default manifest was found"))
}
