//! tunman - Secure shell tunnel supervisor
//!
//! Keeps a fleet of SSH port-forwarding tunnels alive: spawns each one,
//! watches it with periodic health checks, and restarts it with backoff
//! when it dies or fails a check.
//!
//! # Example
//!
//! ```rust,no_run
//! use tunman::loader::ConfigurationLoader;
//! use tunman::app::Application;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let hosts = ConfigurationLoader::new("./conf.d").load_all()?;
//!     let app = Application::new(hosts);
//!     let mut tasks = app.spawn_supervisors().await;
//!     while tasks.join_next().await.is_some() {}
//!
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod app;
pub mod error;
pub mod health;
pub mod http;
pub mod loader;
pub mod model;
pub mod network;
pub mod notify;
pub mod registry;
pub mod remote;
pub mod supervisor;
pub mod templating;

pub use error::{TunmanError, TunmanResult};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize structured logging with tracing
pub fn init_logging() -> TunmanResult<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunman=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| TunmanError::Configuration(e.to_string()))?;

    Ok(())
}
