use std::sync::Arc;

use tunman::app::Application;
use tunman::model::{
    ForwardingMode, HostTunnelDefinitions, PortDefinition, ValidationMethod, ValidationSpec,
};

/// Example: build a host and its forwardings in code instead of loading
/// them from a `conf.d/` directory, then start supervising them.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tunman::init_logging()?;

    let forwarding = tunman::model::Forwarding::new(
        PortDefinition {
            gateway: false,
            host: None,
            port: "8080".to_string(),
        },
        PortDefinition {
            gateway: false,
            host: Some("127.0.0.1".to_string()),
            port: "8080".to_string(),
        },
        ValidationSpec {
            method: ValidationMethod::LocalPortPing,
            interval_secs: 30,
            wait_time_before_restart_secs: 5,
            kill_existing_tunnel_on_failure: true,
            notify_url: None,
        },
        ForwardingMode::Local,
        "example.com:22".to_string(),
    );

    let host = HostTunnelDefinitions {
        remote_user: "username".to_string(),
        remote_host: "example.com".to_string(),
        remote_port: 22,
        remote_key: Some("~/.ssh/id_rsa".to_string()),
        remote_password: None,
        remote_passphrase: None,
        ssh_opts: None,
        forward: vec![forwarding],
        restart_all_on_forward_failure: false,
        variables_post_processor: Some(Arc::new(|vars| {
            if let Some(gw) = vars.get("remote_gw").cloned() {
                vars.insert("remote_gw".to_string(), gw.trim().to_string());
            }
        })),
    };

    println!("Starting tunnel supervisor for {}...", host.ident());
    let app = Application::new(vec![host]);
    let mut tasks = app.spawn_supervisors().await;

    println!("Press Ctrl+C to stop.");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = async { while tasks.join_next().await.is_some() {} } => {}
    }

    app.close_all_tunnels().await;
    Ok(())
}
