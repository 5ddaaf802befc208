//! Configuration loader: scans a `conf.d/` directory for TOML host
//! files, validates them, and builds the [`HostTunnelDefinitions`] fleet the
//! application root runs.
//!
//! Uses a declarative TOML format (see DESIGN.md, Open Question #1): a
//! directory scan, per-file parse, default-fill, then aggregate into the
//! model.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{TunmanError, TunmanResult};
use crate::model::{
    Forwarding, ForwardingMode, HostTunnelDefinitions, PortDefinition, ValidationMethod,
    ValidationSpec,
};

#[derive(Debug, Deserialize)]
struct RawHostFile {
    remote_host: String,
    remote_port: u16,
    remote_user: String,
    remote_key: Option<String>,
    remote_key_passphrase: Option<String>,
    remote_password: Option<String>,
    ssh_opts: Option<String>,
    #[serde(default)]
    restart_all_tunnels_on_forwarding_failure: bool,
    #[serde(rename = "forward")]
    forward: Vec<RawForwarding>,
}

#[derive(Debug, Deserialize)]
struct RawForwarding {
    mode: String,
    local: RawPort,
    remote: RawPort,
    #[serde(default)]
    validate: RawValidation,
    #[serde(default = "default_retries")]
    retries: u32,
    #[serde(default)]
    use_autossh: bool,
    #[serde(default = "default_warm_up_time")]
    warm_up_time: u64,
    #[serde(default = "default_time_before_restart_at_initialization")]
    time_before_restart_at_initialization: u64,
    #[serde(default = "default_wait_time_after_all_retries_failed")]
    wait_time_after_all_retries_failed: u64,
}

#[derive(Debug, Deserialize)]
struct RawPort {
    #[serde(default)]
    gateway: bool,
    host: Option<String>,
    port: String,
}

#[derive(Debug, Deserialize)]
struct RawValidation {
    #[serde(default = "default_validation_method")]
    method: String,
    #[serde(default = "default_validation_interval")]
    interval: u64,
    #[serde(default = "default_wait_time_before_restart")]
    wait_time_before_restart: u64,
    #[serde(default)]
    kill_existing_tunnel_on_failure: bool,
    notify_url: Option<String>,
}

impl Default for RawValidation {
    fn default() -> Self {
        Self {
            method: default_validation_method(),
            interval: default_validation_interval(),
            wait_time_before_restart: default_wait_time_before_restart(),
            kill_existing_tunnel_on_failure: false,
            notify_url: None,
        }
    }
}

fn default_retries() -> u32 {
    10
}
fn default_warm_up_time() -> u64 {
    5
}
fn default_time_before_restart_at_initialization() -> u64 {
    10
}
fn default_wait_time_after_all_retries_failed() -> u64 {
    600
}
fn default_validation_method() -> String {
    "none".to_string()
}
fn default_validation_interval() -> u64 {
    300
}
fn default_wait_time_before_restart() -> u64 {
    10
}

/// Scans `conf_dir` for `*.toml` files and parses each into a
/// [`HostTunnelDefinitions`].
pub struct ConfigurationLoader {
    conf_dir: PathBuf,
}

impl ConfigurationLoader {
    pub fn new(conf_dir: impl AsRef<Path>) -> Self {
        Self {
            conf_dir: conf_dir.as_ref().to_path_buf(),
        }
    }

    pub fn load_all(&self) -> TunmanResult<Vec<HostTunnelDefinitions>> {
        if !self.conf_dir.is_dir() {
            return Err(TunmanError::Configuration(format!(
                "specified directory \"{}\" does not exist",
                self.conf_dir.display()
            )));
        }

        let mut hosts = Vec::new();

        let entries = std::fs::read_dir(&self.conf_dir)?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();

            if path.extension().and_then(|e| e.to_str()) != Some("toml") {
                continue;
            }

            let host = Self::load_one(&path)?;
            hosts.push(host);
        }

        Ok(hosts)
    }

    fn load_one(path: &Path) -> TunmanResult<HostTunnelDefinitions> {
        let content = std::fs::read_to_string(path)?;
        let raw: RawHostFile = toml::from_str(&content)?;

        Self::parse(raw, path)
    }

    fn parse(raw: RawHostFile, path: &Path) -> TunmanResult<HostTunnelDefinitions> {
        if raw.remote_user.trim().is_empty() {
            return Err(TunmanError::Configuration(format!(
                "remote_user must not be empty in {}",
                path.display()
            )));
        }

        if raw.remote_host.trim().is_empty() {
            return Err(TunmanError::Configuration(format!(
                "remote_host must not be empty in {}",
                path.display()
            )));
        }

        if raw.forward.is_empty() {
            return Err(TunmanError::Configuration(format!(
                "at least one [[forward]] entry is required in {}",
                path.display()
            )));
        }

        let host_ident = format!("{}@{}:{}", raw.remote_user, raw.remote_host, raw.remote_port);

        let forward = raw
            .forward
            .into_iter()
            .map(|f| Self::parse_forwarding(f, &host_ident, path))
            .collect::<TunmanResult<Vec<_>>>()?;

        Ok(HostTunnelDefinitions {
            remote_user: raw.remote_user,
            remote_host: raw.remote_host,
            remote_port: raw.remote_port,
            remote_key: raw.remote_key,
            remote_password: raw.remote_password,
            remote_passphrase: raw.remote_key_passphrase,
            ssh_opts: raw.ssh_opts,
            forward,
            restart_all_on_forward_failure: raw.restart_all_tunnels_on_forwarding_failure,
            variables_post_processor: None,
        })
    }

    fn parse_forwarding(
        raw: RawForwarding,
        host_ident: &str,
        path: &Path,
    ) -> TunmanResult<Forwarding> {
        let mode = match raw.mode.as_str() {
            "local" => ForwardingMode::Local,
            "remote" => ForwardingMode::Remote,
            other => {
                return Err(TunmanError::Configuration(format!(
                    "invalid forwarding mode \"{other}\" in {}",
                    path.display()
                )));
            }
        };

        let method = match raw.validate.method.as_str() {
            "none" => ValidationMethod::None,
            "local_port_ping" => ValidationMethod::LocalPortPing,
            "remote_port_ping" => ValidationMethod::RemotePortPing,
            other => {
                return Err(TunmanError::Configuration(format!(
                    "unknown validation method \"{other}\" in {}; callback validators must be attached programmatically, not via file",
                    path.display()
                )));
            }
        };

        let mut forwarding = Forwarding::new(
            PortDefinition {
                gateway: raw.local.gateway,
                host: raw.local.host,
                port: raw.local.port,
            },
            PortDefinition {
                gateway: raw.remote.gateway,
                host: raw.remote.host,
                port: raw.remote.port,
            },
            ValidationSpec {
                method,
                interval_secs: raw.validate.interval,
                wait_time_before_restart_secs: raw.validate.wait_time_before_restart,
                kill_existing_tunnel_on_failure: raw.validate.kill_existing_tunnel_on_failure,
                notify_url: raw.validate.notify_url,
            },
            mode,
            host_ident.to_string(),
        );

        forwarding.retries = raw.retries;
        forwarding.use_autossh = raw.use_autossh;
        forwarding.warm_up_time_secs = raw.warm_up_time;
        forwarding.time_before_restart_at_initialization_secs =
            raw.time_before_restart_at_initialization;
        forwarding.wait_time_after_all_retries_failed_secs =
            raw.wait_time_after_all_retries_failed;

        Ok(forwarding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
remote_host = "example.org"
remote_port = 22
remote_user = "riotkit"

[[forward]]
mode = "local"
[forward.local]
port = "8080"
[forward.remote]
host = "127.0.0.1"
port = "80"
[forward.validate]
method = "local_port_ping"
interval = 60
"#;

    #[test]
    fn parses_minimal_host_file() {
        let raw: RawHostFile = toml::from_str(SAMPLE).unwrap();
        let host = ConfigurationLoader::parse(raw, Path::new("test.toml")).unwrap();

        assert_eq!(host.remote_host, "example.org");
        assert_eq!(host.forward.len(), 1);
        assert!(host.forward[0].is_forwarding_remote_to_local());
        assert_eq!(host.forward[0].validate.interval_secs, 60);
        assert_eq!(host.forward[0].retries, 10);
    }

    #[test]
    fn rejects_unknown_mode() {
        let raw: RawHostFile = toml::from_str(SAMPLE).unwrap();
        let mut raw = raw;
        raw.forward[0].mode = "sideways".to_string();

        assert!(ConfigurationLoader::parse(raw, Path::new("test.toml")).is_err());
    }

    #[test]
    fn rejects_empty_remote_user() {
        let raw: RawHostFile = toml::from_str(SAMPLE).unwrap();
        let mut raw = raw;
        raw.remote_user = String::new();

        assert!(ConfigurationLoader::parse(raw, Path::new("test.toml")).is_err());
    }

    #[test]
    fn rejects_no_forward_entries() {
        let raw: RawHostFile = toml::from_str(SAMPLE).unwrap();
        let mut raw = raw;
        raw.forward.clear();

        assert!(ConfigurationLoader::parse(raw, Path::new("test.toml")).is_err());
    }

    #[test]
    fn rejects_unknown_validation_method() {
        let raw: RawHostFile = toml::from_str(SAMPLE).unwrap();
        let mut raw = raw;
        raw.forward[0].validate.method = "some_custom_tag".to_string();

        assert!(ConfigurationLoader::parse(raw, Path::new("test.toml")).is_err());
    }

    #[test]
    fn missing_directory_is_an_error() {
        let loader = ConfigurationLoader::new("/nonexistent/path/should/not/exist");
        assert!(loader.load_all().is_err());
    }
}
