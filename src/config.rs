//! Persisted configuration and the store that loads and saves it

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Root configuration aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub services: Vec<Service>,

    #[serde(default)]
    pub tls: TlsInfo,

    /// Plain HTTP listener
    #[serde(default = "default_http_settings")]
    pub http: ServerSettings,

    /// TLS listener
    #[serde(default = "default_https_settings")]
    pub https: ServerSettings,

    #[serde(default)]
    pub admin: AdminSettings,
}

/// A named unit of forward rules plus the executables that back it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,

    #[serde(default)]
    pub forward_rules: Vec<ForwardRule>,

    #[serde(default)]
    pub executables: Vec<ExecutableSettings>,
}

/// Forwards requests matching `from` to the base URL `to`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardRule {
    pub from: SourceUrl,
    pub to: String,
}

/// Inbound request matcher. Empty `scheme` or `hostname` match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceUrl {
    #[serde(default)]
    pub scheme: String,

    #[serde(default)]
    pub hostname: String,

    #[serde(default = "default_path")]
    pub path: String,
}

/// How to launch one managed executable
///
/// # Security Warning
///
/// `command` and `args` are executed directly with the permissions of the
/// proxy process. The configuration file is written owner-only, and the
/// procedures that change it require an authenticated session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutableSettings {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory
    #[serde(default)]
    pub dirname: Option<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Start together with the service when it is added or at boot
    #[serde(default)]
    pub autolaunch: bool,

    /// Restart the executable when it exits on its own
    #[serde(default)]
    pub relaunch: bool,

    #[serde(default = "default_relaunch_delay")]
    pub relaunch_delay_secs: u64,

    /// Time between SIGTERM and SIGKILL when stopping
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl ExecutableSettings {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            dirname: None,
            env: BTreeMap::new(),
            autolaunch: false,
            relaunch: false,
            relaunch_delay_secs: default_relaunch_delay(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }

    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_autolaunch(mut self, autolaunch: bool) -> Self {
        self.autolaunch = autolaunch;
        self
    }
}

/// Certificate and key file paths
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateInfo {
    pub certificate: PathBuf,
    pub key: PathBuf,
}

/// Default certificate plus per-hostname certificates selected through SNI
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsInfo {
    #[serde(default)]
    pub default: CertificateInfo,

    #[serde(default)]
    pub named: BTreeMap<String, CertificateInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default)]
    pub enabled: bool,

    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminSettings {
    /// Requests matching any of these are served by the admin endpoint
    #[serde(default)]
    pub rules: Vec<SourceUrl>,

    #[serde(default)]
    pub password_hash: String,

    /// Session lifetime in seconds since last use
    #[serde(default = "default_session_timeout")]
    pub session_timeout: u64,
}

impl Default for AdminSettings {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            password_hash: String::new(),
            session_timeout: default_session_timeout(),
        }
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            tls: TlsInfo::default(),
            http: default_http_settings(),
            https: default_https_settings(),
            admin: AdminSettings::default(),
        }
    }
}

fn default_http_settings() -> ServerSettings {
    ServerSettings {
        enabled: true,
        port: 80,
    }
}

fn default_https_settings() -> ServerSettings {
    ServerSettings {
        enabled: false,
        port: 443,
    }
}

fn default_path() -> String {
    "/".to_string()
}

fn default_relaunch_delay() -> u64 {
    1
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_session_timeout() -> u64 {
    3600
}

impl Configuration {
    pub fn service(&self, name: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn service_mut(&mut self, name: &str) -> Option<&mut Service> {
        self.services.iter_mut().find(|s| s.name == name)
    }

    /// Validate structural invariants that serde cannot express
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        let mut errors = Vec::new();

        for service in &self.services {
            if service.name.is_empty() {
                errors.push("service with empty name".to_string());
            } else if !seen.insert(service.name.as_str()) {
                errors.push(format!("duplicate service name '{}'", service.name));
            }
            for (i, exec) in service.executables.iter().enumerate() {
                if exec.command.is_empty() {
                    errors.push(format!(
                        "service '{}': executable {} has no command",
                        service.name, i
                    ));
                }
            }
        }

        if !errors.is_empty() {
            return Err(Error::Validation(format!(
                "Configuration errors:\n  - {}",
                errors.join("\n  - ")
            )));
        }

        Ok(())
    }
}

/// Owns the in-memory configuration and its backing file.
///
/// The store performs no locking of its own; callers hold the exclusive
/// configuration lock around [`update`](ConfigStore::update).
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    config: Configuration,
}

impl ConfigStore {
    /// Read and parse the file at `path`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let config = read_config(&path)?;
        info!(path = %path.display(), services = config.services.len(), "Configuration loaded");
        Ok(Self { path, config })
    }

    /// Create a store for a configuration that has not been written yet
    pub fn new<P: AsRef<Path>>(path: P, config: Configuration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            config,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Write the current configuration to the recorded path
    pub fn save(&self) -> Result<()> {
        write_config(&self.path, &self.config)
    }

    /// Apply `f` to a copy of the configuration, persist the copy and only
    /// then commit it. If `f` or the write fails, nothing changes.
    pub fn update<R, F>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Configuration) -> Result<R>,
    {
        let mut next = self.config.clone();
        let out = f(&mut next)?;
        write_config(&self.path, &next)?;
        self.config = next;
        Ok(out)
    }
}

fn read_config(path: &Path) -> Result<Configuration> {
    let content = std::fs::read_to_string(path)?;
    let malformed =
        |e: serde_json::Error| Error::Validation(format!("malformed configuration {}: {}", path.display(), e));
    let value: serde_json::Value = serde_json::from_str(&content).map_err(malformed)?;
    // serde also accepts a sequence for a struct with all-default fields
    if !value.is_object() {
        return Err(Error::Validation(format!(
            "malformed configuration {}: expected a JSON object",
            path.display()
        )));
    }
    let config: Configuration = serde_json::from_value(value).map_err(malformed)?;
    config.validate()?;
    Ok(config)
}

fn write_config(path: &Path, config: &Configuration) -> Result<()> {
    let data =
        serde_json::to_vec_pretty(config).map_err(|e| Error::Serialization(e.to_string()))?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    {
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp)?;
        file.write_all(&data)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }

    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }

    debug!(path = %path.display(), bytes = data.len(), "Configuration saved");
    Ok(())
}
