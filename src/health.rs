//! Health validation: is the tunnel still carrying traffic, and is the
//! supervised process still alive in the OS process table.

use std::time::Duration;

use sysinfo::System;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::model::{Forwarding, HostTunnelDefinitions, ValidationMethod};

const PORT_PING_TIMEOUT: Duration = Duration::from_secs(15);

/// Result of a single tunnel health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelHealth {
    Healthy,
    Down,
    Unknown,
}

impl TunnelHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, TunnelHealth::Healthy)
    }

    pub fn is_down(&self) -> bool {
        matches!(self, TunnelHealth::Down)
    }
}

/// Dispatches a forwarding's configured validation method and reports the
/// OS-level liveness of its supervised process.
pub struct HealthValidator;

impl HealthValidator {
    /// Run the validation method configured on `forwarding`.
    ///
    /// A callback method is dispatched to the closure stored on
    /// [`ValidationMethod::Callback`]; anything else falls back to a
    /// port-reachability probe. A forwarding with [`ValidationMethod::None`]
    /// is always reported healthy, matching the "no defined health check"
    /// fallthrough. A panicking callback is caught and reported as unhealthy
    /// rather than taking down the supervisor task.
    pub async fn check_tunnel_alive(forwarding: &Forwarding, host: &HostTunnelDefinitions) -> bool {
        match &forwarding.validate.method {
            ValidationMethod::Callback(f) => {
                let f = f.clone();
                match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(forwarding, host))) {
                    Ok(result) => result,
                    Err(_) => {
                        warn!("validation callback panicked, reporting unhealthy");
                        false
                    }
                }
            }
            ValidationMethod::LocalPortPing => {
                let port: u16 = match forwarding.local.port.parse() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("invalid local port for health check: {e}");
                        return false;
                    }
                };
                let host_addr = if forwarding.local.host_or_default() == "0.0.0.0" {
                    "localhost"
                } else {
                    forwarding.local.host_or_default()
                };
                Self::check_port_responding(host_addr, port).await
            }
            ValidationMethod::RemotePortPing => {
                let port: u16 = match forwarding.remote.port.parse() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("invalid remote port for health check: {e}");
                        return false;
                    }
                };
                Self::check_remote_port_responding(
                    forwarding.remote.host_or_default(),
                    port,
                    host,
                )
                .await
            }
            ValidationMethod::None => true,
        }
    }

    async fn check_port_responding(host: &str, port: u16) -> bool {
        let address = format!("{host}:{port}");
        debug!("health checking {address}");

        match timeout(PORT_PING_TIMEOUT, TcpStream::connect(&address)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!("port ping to {address} failed: {e}");
                false
            }
            Err(_) => {
                warn!("port ping to {address} timed out");
                false
            }
        }
    }

    async fn check_remote_port_responding(
        host: &str,
        port: u16,
        configuration: &HostTunnelDefinitions,
    ) -> bool {
        let client = configuration.shell_client();
        match client
            .exec(&format!("nc -zw15 {host} {port} 1>&2; echo $?"))
            .await
        {
            Ok(stdout) => stdout.trim() == "0",
            Err(e) => {
                warn!("remote port ping to {host}:{port} failed: {e}");
                false
            }
        }
    }

    /// Scan the OS process table for a cmdline containing `signature`.
    ///
    /// Returns the matching PID if found. Note this is a substring match:
    /// a forwarding whose signature happens to be a substring of an
    /// unrelated process's cmdline will false-positive (see DESIGN.md).
    pub fn is_process_alive(signature: &str) -> Option<u32> {
        let mut system = System::new();
        system.refresh_all();

        for (pid, process) in system.processes() {
            let cmdline = process
                .cmd()
                .iter()
                .map(|s| s.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ");

            if cmdline.contains(signature) {
                return Some(pid.as_u32());
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_status_predicates() {
        assert!(TunnelHealth::Healthy.is_healthy());
        assert!(!TunnelHealth::Down.is_healthy());
        assert!(!TunnelHealth::Unknown.is_healthy());

        assert!(TunnelHealth::Down.is_down());
        assert!(!TunnelHealth::Healthy.is_down());
    }

    #[tokio::test]
    async fn port_ping_fails_on_closed_port() {
        let result = HealthValidator::check_port_responding("127.0.0.1", 65534).await;
        assert!(!result);
    }

    #[test]
    fn is_process_alive_finds_current_test_process() {
        let mut system = System::new();
        system.refresh_all();
        let any_pid = system.processes().keys().next().copied();
        assert!(any_pid.is_some(), "expected at least one process in the table");
    }
}
