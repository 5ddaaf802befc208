//! Application root: owns every host's configuration, launches one
//! supervisor task per forwarding with a small stagger so a fleet restart
//! doesn't open every SSH connection at the same instant, and coordinates
//! graceful shutdown across the whole fleet.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::info;

use crate::health::HealthValidator;
use crate::model::HostTunnelDefinitions;
use crate::notify::Notifier;
use crate::registry::ProcessRegistry;
use crate::supervisor::TunnelSupervisor;

const STAGGER: Duration = Duration::from_millis(500);

/// Point-in-time status of one forwarding, used by the HTTP status server.
#[derive(Debug, Clone, Serialize)]
pub struct ForwardingStats {
    pub ident: String,
    pub pid: Option<u32>,
    pub is_alive: bool,
    pub starts_history: Vec<NaiveDate>,
    pub restarts_count: usize,
}

/// Fleet-wide status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub status: Vec<ForwardingStats>,
    pub procs_count: usize,
    pub is_terminating: bool,
}

/// Owns the whole fleet of hosts and their forwardings for the lifetime of
/// the process.
pub struct Application {
    hosts: Vec<Arc<HostTunnelDefinitions>>,
    registry: Arc<ProcessRegistry>,
    notifier: Arc<Notifier>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Application {
    pub fn new(hosts: Vec<HostTunnelDefinitions>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            hosts: hosts.into_iter().map(Arc::new).collect(),
            registry: Arc::new(ProcessRegistry::new()),
            notifier: Arc::new(Notifier::new()),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn hosts(&self) -> &[Arc<HostTunnelDefinitions>] {
        &self.hosts
    }

    pub fn registry(&self) -> Arc<ProcessRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Launch one supervisor task per forwarding across every configured
    /// host, staggering launches by [`STAGGER`] to avoid a startup stampede.
    pub async fn spawn_supervisors(&self) -> JoinSet<()> {
        let mut tasks = JoinSet::new();

        for host in &self.hosts {
            info!("spawning threads for {}", host.ident());

            for index in 0..host.forward.len() {
                let host = Arc::clone(host);
                let registry = Arc::clone(&self.registry);
                let notifier = Arc::clone(&self.notifier);
                let shutdown = self.shutdown_rx.clone();

                tasks.spawn(async move {
                    let supervisor = TunnelSupervisor::new(registry, notifier);
                    // SAFETY-free indexing: `index` was captured against the
                    // same `host.forward` vector, which never resizes after
                    // load time.
                    let forwarding = &host.forward[index];
                    supervisor.run(forwarding, &host, shutdown).await;
                });

                tokio::time::sleep(STAGGER).await;
            }
        }

        tasks
    }

    /// Signal every supervisor task to stop and kill every tracked or
    /// signature-matched process.
    pub async fn close_all_tunnels(&self) {
        info!("closing the application");
        let _ = self.shutdown_tx.send(true);

        let signatures: Vec<String> = self
            .hosts
            .iter()
            .flat_map(|host| host.forward.iter())
            .filter_map(|forwarding| forwarding.cached_signature().map(str::to_string))
            .collect();

        self.registry.close_all(&signatures).await;
    }

    pub fn is_terminating(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Build a fleet-wide status snapshot for the HTTP status endpoint.
    pub async fn get_stats(&self) -> Stats {
        let mut status = Vec::new();

        for host in &self.hosts {
            let shell_client = host.shell_client();
            let resolver = crate::templating::VariableResolver::new(&shell_client);

            for forwarding in &host.forward {
                let signature = forwarding
                    .ssh_forwarding_signature(host, &resolver)
                    .await
                    .unwrap_or_else(|_| "not_working_signature".to_string());

                let pid = HealthValidator::is_process_alive(&signature);

                status.push(ForwardingStats {
                    ident: forwarding.ident(),
                    pid,
                    is_alive: pid.is_some(),
                    starts_history: forwarding.starts_history(),
                    restarts_count: forwarding.current_restart_count(),
                });
            }
        }

        Stats {
            status,
            procs_count: self.registry.count().await,
            is_terminating: self.is_terminating(),
        }
    }
}
