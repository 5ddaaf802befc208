//! Admin actions: one-shot maintenance commands that operate on every
//! loaded host and then exit, never starting a supervisor.

use std::path::PathBuf;

use tokio::process::Command;
use tracing::info;

use crate::error::TunmanResult;
use crate::model::HostTunnelDefinitions;

/// For every host, shell out to `ssh-copy-id` using the same connection
/// string builder the supervisor uses for `ssh`/`autossh`.
pub async fn send_public_key(hosts: &[HostTunnelDefinitions]) -> TunmanResult<()> {
    for host in hosts {
        info!(
            "processing {}, please enter credentials when asked",
            host.ident()
        );

        let conn = host.create_ssh_connection_string(true, true, "");
        let conn = conn.trim();

        let status = Command::new("sh")
            .arg("-c")
            .arg(format!("ssh-copy-id {conn}"))
            .status()
            .await?;

        if !status.success() {
            tracing::warn!("ssh-copy-id exited non-zero for {}", host.ident());
        }
    }

    Ok(())
}

/// Ensure `~/.ssh/known_hosts` exists, then append `ssh-keyscan` output for
/// every host whose hostname isn't already present (a substring dedup
/// heuristic — not airtight, but cheap and idempotent enough in practice).
pub async fn add_to_known_hosts(hosts: &[HostTunnelDefinitions]) -> TunmanResult<()> {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
    let ssh_dir = PathBuf::from(&home).join(".ssh");
    let known_hosts = ssh_dir.join("known_hosts");

    std::fs::create_dir_all(&ssh_dir)?;
    if !known_hosts.exists() {
        std::fs::write(&known_hosts, "")?;
    }

    let mut content = std::fs::read_to_string(&known_hosts)?;

    for host in hosts {
        info!("adding {} to {}", host.ident(), known_hosts.display());

        if content.contains(&host.remote_host) {
            info!("{} already present in {}", host.remote_host, known_hosts.display());
            continue;
        }

        let keyscan_cmd = host.create_ssh_keyscan_command("ssh-keyscan");

        let output = Command::new("sh")
            .arg("-c")
            .arg(&keyscan_cmd)
            .output()
            .await?;

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&known_hosts)?;
        use std::io::Write;
        file.write_all(&output.stdout)?;

        content.push_str(&String::from_utf8_lossy(&output.stdout));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ForwardingMode, PortDefinition, ValidationMethod, ValidationSpec};

    fn host_with_one_forwarding() -> HostTunnelDefinitions {
        let forwarding = crate::model::Forwarding::new(
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
                method: ValidationMethod::None,
                interval_secs: 30,
                wait_time_before_restart_secs: 5,
                kill_existing_tunnel_on_failure: false,
                notify_url: None,
            },
            ForwardingMode::Remote,
            "example-host".to_string(),
        );

        HostTunnelDefinitions {
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
        }
    }

    #[test]
    fn host_ident_is_reused_for_logging() {
        let host = host_with_one_forwarding();
        assert_eq!(host.ident(), "riotkit@example.org:22");
    }
}
