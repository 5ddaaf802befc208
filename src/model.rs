//! Host & forwarding data model: the static definition of one SSH
//! tunnel and of the host it runs against, plus the string builders that
//! turn that definition into actual `ssh`/`autossh` command lines.
//!
//! Deliberately avoids a `Forwarding -> Arc<HostTunnelDefinitions>` back
//! reference (see DESIGN.md, "Host<->Forwarding cyclic reference"):
//! every builder that needs both takes them as separate parameters, the
//! same way a plain function taking both arguments would.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, Utc};
use tokio::sync::OnceCell;

use crate::error::TunmanResult;
use crate::remote::{RemoteEndpoint, RemoteShellClient};
use crate::templating::VariableResolver;

/// Signature of a user-supplied health-check callback: given the forwarding
/// and its host, report whether the tunnel is still healthy.
pub type ValidationCallback = Arc<dyn Fn(&Forwarding, &HostTunnelDefinitions) -> bool + Send + Sync>;

/// Signature of a user-supplied post-processor over a resolved topology
/// variables map, applied just before template rendering.
pub type VariablesPostProcessor = Arc<dyn Fn(&mut HashMap<String, String>) + Send + Sync>;

/// Direction a [`Forwarding`] tunnels traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardingMode {
    /// `-L`: expose a remote resource on the local machine.
    Local,
    /// `-R`: expose a local resource on the remote machine.
    Remote,
}

/// One endpoint (local or remote) of a forwarding: host/port, optionally
/// templated, optionally bound with `-g` (gateway mode).
#[derive(Debug, Clone)]
pub struct PortDefinition {
    pub gateway: bool,
    pub host: Option<String>,
    pub port: String,
}

impl PortDefinition {
    pub fn host_or_default(&self) -> &str {
        match &self.host {
            Some(h) if !h.is_empty() => h,
            _ => "0.0.0.0",
        }
    }
}

/// How an already-running tunnel is confirmed to still be healthy.
#[derive(Clone)]
pub enum ValidationMethod {
    LocalPortPing,
    RemotePortPing,
    /// Arbitrary user-supplied health check, attached programmatically — a
    /// file-based configuration can never carry a callback, so the loader
    /// rejects any tag it doesn't otherwise recognize.
    Callback(ValidationCallback),
    None,
}

impl std::fmt::Debug for ValidationMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationMethod::LocalPortPing => write!(f, "LocalPortPing"),
            ValidationMethod::RemotePortPing => write!(f, "RemotePortPing"),
            ValidationMethod::Callback(_) => write!(f, "Callback(..)"),
            ValidationMethod::None => write!(f, "None"),
        }
    }
}

/// Health-check policy attached to one [`Forwarding`].
#[derive(Debug, Clone)]
pub struct ValidationSpec {
    pub method: ValidationMethod,
    pub interval_secs: u64,
    pub wait_time_before_restart_secs: u64,
    pub kill_existing_tunnel_on_failure: bool,
    pub notify_url: Option<String>,
}

/// A single local<->remote tunnel definition, aggregated under a
/// [`HostTunnelDefinitions`] but never holding a reference back to it.
#[derive(Debug)]
pub struct Forwarding {
    pub local: PortDefinition,
    pub remote: PortDefinition,
    pub validate: ValidationSpec,
    pub mode: ForwardingMode,
    pub host_ident: String,

    /// How many consecutive failures before backing off with a long sleep.
    pub retries: u32,
    /// Whether to wrap the ssh invocation with `autossh -M 0`.
    pub use_autossh: bool,
    /// Seconds to wait after spawn before the first liveness check.
    pub warm_up_time_secs: u64,
    /// Extra sleep applied when the process died during warm-up.
    pub time_before_restart_at_initialization_secs: u64,
    /// Sleep applied once the retry budget for this forwarding is exhausted.
    pub wait_time_after_all_retries_failed_secs: u64,

    signature_cache: OnceCell<String>,
    starts_history: Mutex<Vec<NaiveDate>>,
}

impl Forwarding {
    pub fn new(
        local: PortDefinition,
        remote: PortDefinition,
        validate: ValidationSpec,
        mode: ForwardingMode,
        host_ident: String,
    ) -> Self {
        Self {
            local,
            remote,
            validate,
            mode,
            host_ident,
            retries: 10,
            use_autossh: false,
            warm_up_time_secs: 5,
            time_before_restart_at_initialization_secs: 10,
            wait_time_after_all_retries_failed_secs: 600,
            signature_cache: OnceCell::new(),
            starts_history: Mutex::new(Vec::new()),
        }
    }

    /// The forwarding signature, if it has already been resolved once by
    /// [`Self::ssh_forwarding_signature`]. Used for shutdown bookkeeping,
    /// where re-resolving (possibly over the network) would be wasted work.
    pub fn cached_signature(&self) -> Option<&str> {
        self.signature_cache.get().map(String::as_str)
    }

    pub fn is_forwarding_remote_to_local(&self) -> bool {
        matches!(self.mode, ForwardingMode::Local)
    }

    pub fn is_forwarding_local_to_remote(&self) -> bool {
        matches!(self.mode, ForwardingMode::Remote)
    }

    /// Build the `-L`/`-R` SSH forwarding options, rendering any `{{ ... }}`
    /// tokens against `host` via `resolver`. Cached after first resolution —
    /// the forwarding spec never changes shape once running.
    pub async fn ssh_forwarding_signature(
        &self,
        host: &HostTunnelDefinitions,
        resolver: &VariableResolver<'_>,
    ) -> TunmanResult<String> {
        if let Some(cached) = self.signature_cache.get() {
            return Ok(cached.clone());
        }

        let mut c_str =
            " -o ServerAliveInterval=15 -o ServerAliveCountMax=4 -o ExitOnForwardFailure=yes "
                .to_string();

        if self.remote.gateway || self.local.gateway {
            c_str.push_str(" -g ");
        }

        if self.is_forwarding_local_to_remote() {
            c_str.push_str("-R ");
            if !self.remote.gateway {
                c_str.push_str(&format!("{}:", self.remote.host_or_default()));
            }
            c_str.push_str(&format!(
                "{}:{}:{}",
                self.remote.port,
                self.local.host_or_default(),
                self.local.port
            ));
        }

        if self.is_forwarding_remote_to_local() {
            c_str.push_str("-L ");
            if !self.local.gateway {
                c_str.push_str(&format!("{}:", self.local.host_or_default()));
            }
            c_str.push_str(&format!(
                "{}:{}:{}",
                self.local.port,
                self.remote.host_or_default(),
                self.remote.port
            ));
        }

        let rendered = host.parse(&c_str, resolver).await?;

        let _ = self.signature_cache.set(rendered.clone());
        Ok(rendered)
    }

    /// Full SSH argument string including the forwarding signature.
    pub async fn ssh_arguments(
        &self,
        host: &HostTunnelDefinitions,
        resolver: &VariableResolver<'_>,
        with_forwarding: bool,
    ) -> TunmanResult<String> {
        let append = if with_forwarding {
            self.ssh_forwarding_signature(host, resolver).await?
        } else {
            String::new()
        };

        Ok(host.create_ssh_connection_string(true, true, &append))
    }

    /// Record that the tunnel just (re)started.
    pub fn on_tunnel_started(&self) {
        let mut history = self.starts_history.lock().expect("starts_history poisoned");
        history.push(Utc::now().date_naive());
    }

    /// Number of restarts so far (0 on first successful start).
    pub fn current_restart_count(&self) -> usize {
        let history = self.starts_history.lock().expect("starts_history poisoned");
        history.len().saturating_sub(1)
    }

    /// Every recorded start date, oldest first.
    pub fn starts_history(&self) -> Vec<NaiveDate> {
        self.starts_history
            .lock()
            .expect("starts_history poisoned")
            .clone()
    }

    pub fn ident(&self) -> String {
        let local_ident = format!("{}:{}", self.local.host_or_default(), self.local.port);
        let remote_ident = format!("{}:{}", self.remote.host_or_default(), self.remote.port);
        format!("Forward[{local_ident}][{remote_ident}]_at_{}", self.host_ident)
    }
}

/// Single host, multiple tunnel definitions. Owns the remote SSH endpoint
/// shared by every [`Forwarding`] that targets it.
pub struct HostTunnelDefinitions {
    pub remote_user: String,
    pub remote_host: String,
    pub remote_port: u16,
    pub remote_key: Option<String>,
    pub remote_password: Option<String>,
    pub remote_passphrase: Option<String>,
    pub ssh_opts: Option<String>,
    pub forward: Vec<Forwarding>,
    /// Kill every remote SSH session when a forward failure is detected in
    /// autossh's output, freeing a port a crashed previous process held.
    pub restart_all_on_forward_failure: bool,
    /// Mutates the resolved topology variables map before it's rendered
    /// into a template; only settable programmatically (TOML configuration
    /// files have no way to express a closure).
    pub variables_post_processor: Option<VariablesPostProcessor>,
}

impl std::fmt::Debug for HostTunnelDefinitions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostTunnelDefinitions")
            .field("remote_user", &self.remote_user)
            .field("remote_host", &self.remote_host)
            .field("remote_port", &self.remote_port)
            .field("remote_key", &self.remote_key)
            .field("ssh_opts", &self.ssh_opts)
            .field("forward", &self.forward)
            .field(
                "restart_all_on_forward_failure",
                &self.restart_all_on_forward_failure,
            )
            .field(
                "variables_post_processor",
                &self.variables_post_processor.is_some(),
            )
            .finish_non_exhaustive()
    }
}

impl HostTunnelDefinitions {
    pub fn remote_endpoint(&self) -> RemoteEndpoint {
        RemoteEndpoint {
            user: self.remote_user.clone(),
            host: self.remote_host.clone(),
            port: self.remote_port,
            key: self.remote_key.clone(),
            key_passphrase: self.remote_passphrase.clone(),
            password: self.remote_password.clone(),
        }
    }

    pub fn shell_client(&self) -> RemoteShellClient {
        RemoteShellClient::new(self.remote_endpoint())
    }

    /// Render `{{ token }}` placeholders in `conn_string` against this
    /// host's topology (see [`VariableResolver::render`]).
    pub async fn parse(
        &self,
        conn_string: &str,
        resolver: &VariableResolver<'_>,
    ) -> TunmanResult<String> {
        resolver
            .render(conn_string, self.variables_post_processor.as_deref())
            .await
    }

    pub fn create_ssh_connection_string(
        &self,
        with_key: bool,
        with_custom_opts: bool,
        append: &str,
    ) -> String {
        let mut opts = String::new();

        if with_custom_opts && let Some(extra) = &self.ssh_opts {
            opts.push_str(&format!(" {extra} "));
        }

        if with_key && let Some(key) = &self.remote_key {
            opts.push_str(&format!(" -i {key}"));
        }

        opts.push_str(&format!(" {append} "));
        opts.push_str(&format!(
            "-p {} {}@{}",
            self.remote_port, self.remote_user, self.remote_host
        ));

        opts
    }

    pub fn create_ssh_keyscan_command(&self, executable: &str) -> String {
        format!("{executable} -p {} {}", self.remote_port, self.remote_host)
    }

    /// Full `autossh`-wrapped command for one of this host's forwardings.
    pub async fn create_complete_command_with_supervision(
        &self,
        forwarding: &Forwarding,
        resolver: &VariableResolver<'_>,
    ) -> TunmanResult<String> {
        let args = forwarding.ssh_arguments(self, resolver, true).await?;
        let mut cmd = String::new();

        if let Some(password) = &self.remote_password {
            cmd.push_str(&format!("sshpass -p \"{password}\" "));
        }

        if forwarding.use_autossh {
            cmd.push_str(&format!(
                "autossh -M 0 -N -f -o 'PubkeyAuthentication=yes' -o 'PasswordAuthentication=no' -nT {args}"
            ));
        } else {
            cmd.push_str(&format!("ssh -N -T {args}"));
        }

        Ok(cmd)
    }

    pub fn ident(&self) -> String {
        format!("{}@{}:{}", self.remote_user, self.remote_host, self.remote_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_to_remote_forwarding() -> Forwarding {
        Forwarding::new(
            PortDefinition {
                gateway: false,
                host: None,
                port: "8080".to_string(),
            },
            PortDefinition {
                gateway: false,
                host: Some("127.0.0.1".to_string()),
                port: "80".to_string(),
            },
            ValidationSpec {
                method: ValidationMethod::LocalPortPing,
                interval_secs: 30,
                wait_time_before_restart_secs: 5,
                kill_existing_tunnel_on_failure: true,
                notify_url: None,
            },
            ForwardingMode::Remote,
            "example-host".to_string(),
        )
    }

    #[test]
    fn ident_matches_the_bracketed_format() {
        let forwarding = local_to_remote_forwarding();
        assert_eq!(
            forwarding.ident(),
            "Forward[0.0.0.0:8080][127.0.0.1:80]_at_example-host"
        );
    }

    #[test]
    fn current_restart_count_is_zero_before_any_start() {
        let forwarding = local_to_remote_forwarding();
        assert_eq!(forwarding.current_restart_count(), 0);
    }

    #[test]
    fn current_restart_count_increments_after_restarts() {
        let forwarding = local_to_remote_forwarding();
        forwarding.on_tunnel_started();
        forwarding.on_tunnel_started();
        forwarding.on_tunnel_started();
        assert_eq!(forwarding.current_restart_count(), 2);
    }

    #[test]
    fn ssh_connection_string_includes_user_host_port() {
        let host = HostTunnelDefinitions {
            remote_user: "riotkit".to_string(),
            remote_host: "example.org".to_string(),
            remote_port: 2200,
            remote_key: Some("/home/user/.ssh/id_rsa".to_string()),
            remote_password: None,
            remote_passphrase: None,
            ssh_opts: Some("-vv".to_string()),
            forward: Vec::new(),
            restart_all_on_forward_failure: false,
            variables_post_processor: None,
        };

        let conn = host.create_ssh_connection_string(true, true, "-L 80:localhost:80");

        assert!(conn.contains("riotkit@example.org"));
        assert!(conn.contains("-p 2200"));
        assert!(conn.contains("-i /home/user/.ssh/id_rsa"));
        assert!(conn.contains("-vv"));
    }

    #[test]
    fn keyscan_command_uses_port_and_host() {
        let host = HostTunnelDefinitions {
            remote_user: "riotkit".to_string(),
            remote_host: "example.org".to_string(),
            remote_port: 2200,
            remote_key: None,
            remote_password: None,
            remote_passphrase: None,
            ssh_opts: None,
            forward: Vec::new(),
            restart_all_on_forward_failure: false,
            variables_post_processor: None,
        };

        assert_eq!(
            host.create_ssh_keyscan_command("ssh-keyscan"),
            "ssh-keyscan -p 2200 example.org"
        );
    }

    fn host_with_forwarding(use_autossh: bool) -> (HostTunnelDefinitions, RemoteShellClient) {
        let mut forwarding = local_to_remote_forwarding();
        forwarding.use_autossh = use_autossh;

        let host = HostTunnelDefinitions {
            remote_user: "riotkit".to_string(),
            remote_host: "example.org".to_string(),
            remote_port: 22,
            remote_key: None,
            remote_password: None,
            remote_passphrase: None,
            ssh_opts: None,
            forward: vec![forwarding],
            restart_all_on_forward_failure: false,
            variables_post_processor: None,
        };

        let client = host.shell_client();
        (host, client)
    }

    #[tokio::test]
    async fn supervision_command_uses_autossh_when_enabled() {
        let (host, client) = host_with_forwarding(true);
        let resolver = VariableResolver::new(&client);

        let cmd = host
            .create_complete_command_with_supervision(&host.forward[0], &resolver)
            .await
            .unwrap();

        assert!(cmd.starts_with("autossh -M 0 -N -f"));
    }

    #[tokio::test]
    async fn supervision_command_uses_plain_ssh_when_autossh_disabled() {
        let (host, client) = host_with_forwarding(false);
        let resolver = VariableResolver::new(&client);

        let cmd = host
            .create_complete_command_with_supervision(&host.forward[0], &resolver)
            .await
            .unwrap();

        assert!(cmd.starts_with("ssh -N -T"));
        assert!(!cmd.contains("autossh"));
    }
}
