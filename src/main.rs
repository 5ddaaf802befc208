use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{error, info};

use tunman::admin;
use tunman::app::Application;
use tunman::http;
use tunman::loader::ConfigurationLoader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Action {
    Start,
    #[value(name = "send-public-key")]
    SendPublicKey,
    #[value(name = "add-to-known-hosts")]
    AddToKnownHosts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Environment {
    Prod,
    Debug,
}

#[derive(Debug, Parser)]
#[command(name = "tunman", version, about = "Secure shell tunnel supervisor")]
struct Cli {
    /// Action to run
    action: Action,

    /// Path to the configuration directory (contains conf.d/)
    #[arg(short, long, env = "TUNMAN_CONFIG", default_value = ".")]
    config: String,

    /// HTTP port to listen on
    #[arg(short, long, default_value_t = 8015)]
    port: u16,

    /// Address to listen on
    #[arg(short, long, default_value = "0.0.0.0")]
    listen: String,

    /// URL path prefix for the status endpoints
    #[arg(short, long, env = "TUNMAN_SECRET_PREFIX", default_value = "")]
    secret_prefix: String,

    /// Runtime environment, affects log verbosity defaults
    #[arg(short, long, env = "TUNMAN_ENV", default_value = "prod")]
    env: Environment,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tunman::init_logging()?;

    let cli = Cli::parse();

    if cli.env == Environment::Debug {
        info!("running in debug environment");
    }

    let conf_d = std::path::Path::new(&cli.config).join("conf.d");
    let hosts = ConfigurationLoader::new(&conf_d).load_all()?;

    info!("loaded {} host configuration(s) from {}", hosts.len(), conf_d.display());

    match cli.action {
        Action::SendPublicKey => {
            admin::send_public_key(&hosts).await?;
            return Ok(());
        }
        Action::AddToKnownHosts => {
            admin::add_to_known_hosts(&hosts).await?;
            return Ok(());
        }
        Action::Start => {}
    }

    let app = Arc::new(Application::new(hosts));

    let mut supervisor_tasks = app.spawn_supervisors().await;

    let secret_prefix = if cli.secret_prefix.is_empty() {
        None
    } else {
        Some(cli.secret_prefix.as_str())
    };
    let static_dir = std::path::Path::new(&cli.config).join("static");
    let router = http::build_router(
        Arc::clone(&app),
        Some(static_dir.to_string_lossy().as_ref()),
        secret_prefix,
    );

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", cli.listen, cli.port)).await?;
    info!("status server listening on {}:{}", cli.listen, cli.port);

    let server = axum::serve(listener, router);

    info!("starting tunnel supervisors. Press Ctrl+C to stop.");

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down...");
        }
        result = server => {
            if let Err(e) = result {
                error!("status server error: {e}");
            }
        }
        _ = async {
            while supervisor_tasks.join_next().await.is_some() {}
        } => {
            info!("all supervisors exited");
        }
    }

    app.close_all_tunnels().await;
    supervisor_tasks.shutdown().await;

    info!("shutdown complete");
    Ok(())
}
