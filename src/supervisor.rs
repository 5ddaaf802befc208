//! Tunnel supervisor: the per-forwarding state machine that spawns the
//! `autossh`/`ssh` process, waits out its warm-up window, then monitors it
//! until it dies or fails health checks, retrying with backoff and finally
//! cooling down once its retry budget is exhausted.
//!
//! Structured as an explicit state enum driven by one loop rather than
//! recursion, since idiomatic Rust prefers a visible state machine over
//! recursive control flow for long-running supervisors.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::health::HealthValidator;
use crate::model::{Forwarding, HostTunnelDefinitions};
use crate::notify::Notifier;
use crate::registry::ProcessRegistry;
use crate::templating::VariableResolver;

/// What the driving loop should do after one pass through a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Restart,
    Terminate,
}

/// Explicit states of one supervised tunnel's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Spawning,
    WarmUp,
    Monitoring,
    GraceWait,
    Respawn,
    CooldownLong,
    Terminate,
}

/// Runs one [`Forwarding`] forever: spawn, warm up, monitor, recover, repeat.
///
/// Exits only when `shutdown` fires or an unrecoverable application error is
/// detected.
pub struct TunnelSupervisor {
    registry: Arc<ProcessRegistry>,
    notifier: Arc<Notifier>,
}

impl TunnelSupervisor {
    pub fn new(registry: Arc<ProcessRegistry>, notifier: Arc<Notifier>) -> Self {
        Self { registry, notifier }
    }

    /// Drive `forwarding` forever until `shutdown` fires.
    pub async fn run(
        &self,
        forwarding: &Forwarding,
        host: &HostTunnelDefinitions,
        shutdown: watch::Receiver<bool>,
    ) {
        let shell_client = host.shell_client();
        let resolver = VariableResolver::new(&shell_client);

        let signature = match forwarding.ssh_forwarding_signature(host, &resolver).await {
            Ok(sig) => sig,
            Err(e) => {
                error!("cannot create a forwarding signature, maybe an SSH error? {e}");
                "not_working_signature".to_string()
            }
        };

        match forwarding.ssh_arguments(host, &resolver, true).await {
            Ok(args) => info!("created SSH args: {args}"),
            Err(e) => warn!("could not render SSH args for logging: {e}"),
        }

        let mut retries_left = forwarding.retries;
        let mut shutdown = shutdown;

        loop {
            if *shutdown.borrow() {
                return;
            }

            if retries_left == 0 {
                retries_left = forwarding.retries;
                if !Self::carefully_sleep(
                    Duration::from_secs(forwarding.wait_time_after_all_retries_failed_secs),
                    &mut shutdown,
                )
                .await
                {
                    return;
                }
            }

            let signal = self
                .spawn_and_supervise(forwarding, host, &resolver, &signature, &mut shutdown)
                .await;

            match signal {
                Signal::Terminate => return,
                Signal::Restart => {
                    if !Self::carefully_sleep(Duration::from_secs(2), &mut shutdown).await {
                        return;
                    }
                    retries_left -= 1;
                }
            }
        }
    }

    async fn spawn_and_supervise(
        &self,
        forwarding: &Forwarding,
        host: &HostTunnelDefinitions,
        resolver: &VariableResolver<'_>,
        signature: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Signal {
        self.registry.clean_up_exited().await;

        if *shutdown.borrow() {
            return Signal::Terminate;
        }

        let cmd = match host
            .create_complete_command_with_supervision(forwarding, resolver)
            .await
        {
            Ok(cmd) => cmd,
            Err(e) => {
                error!("failed to build supervised command: {e}");
                return Signal::Restart;
            }
        };

        let (handle_id, pid) = match self.registry.spawn(&cmd).await {
            Ok(pair) => pair,
            Err(e) => {
                error!("{e}");
                return Signal::Restart;
            }
        };

        forwarding.on_tunnel_started();
        self.notifier.notify_tunnel_restarted(forwarding).await;

        debug!("spawned pid={pid} for signature \"{signature}\", entering warm-up");

        if !Self::carefully_sleep(
            Duration::from_secs(forwarding.warm_up_time_secs),
            shutdown,
        )
        .await
        {
            return Signal::Terminate;
        }

        if HealthValidator::is_process_alive(signature).is_none() {
            let (stdout, stderr) = self.registry.communicate(handle_id).await;
            error!("cannot spawn {cmd}, stdout={stdout}, stderr={stderr}");

            if !Self::recover_from_error(&format!("{stdout}{stderr}"), host).await {
                Self::carefully_sleep(
                    Duration::from_secs(forwarding.time_before_restart_at_initialization_secs),
                    shutdown,
                )
                .await;
            }

            return Signal::Restart;
        }

        info!("process for \"{signature}\" survived initialization, pid={pid}");

        self.tunnel_loop(forwarding, host, signature, shutdown).await
    }

    async fn tunnel_loop(
        &self,
        forwarding: &Forwarding,
        host: &HostTunnelDefinitions,
        signature: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Signal {
        debug!("starting monitoring loop for \"{signature}\"");

        loop {
            if !Self::carefully_sleep(
                Duration::from_secs(forwarding.validate.interval_secs),
                shutdown,
            )
            .await
            {
                return Signal::Terminate;
            }

            if HealthValidator::is_process_alive(signature).is_none() {
                error!("the tunnel process exited for signature \"{signature}\"");
                return Signal::Restart;
            }

            debug!("running checks for signature \"{signature}\"");

            if HealthValidator::check_tunnel_alive(forwarding, host).await {
                continue;
            }

            error!(
                "the health check \"{:?}\" failed for signature \"{signature}\"",
                forwarding.validate.method
            );

            let wait = Duration::from_secs(forwarding.validate.wait_time_before_restart_secs);
            sleep(wait).await;

            if !wait.is_zero() && HealthValidator::check_tunnel_alive(forwarding, host).await {
                info!("tunnel \"{signature}\" was recovered without a restart");
                continue;
            }

            if forwarding.validate.kill_existing_tunnel_on_failure {
                ProcessRegistry::kill_by_signature(signature);
            }

            return Signal::Restart;
        }
    }

    async fn recover_from_error(error_message: &str, host: &HostTunnelDefinitions) -> bool {
        if error_message.contains("remote port forwarding failed for listen port")
            && host.restart_all_on_forward_failure
        {
            warn!("killing all remote SSH sessions to free up the busy port");
            let client = host.shell_client();
            let _ = client.kill_all_sessions().await;
            sleep(Duration::from_secs(2)).await;
            return true;
        }

        false
    }

    /// Sleep in 1-second increments, checking `shutdown` between each tick so
    /// a long cooldown can still be interrupted promptly. Returns `false` if
    /// shutdown fired during the sleep.
    async fn carefully_sleep(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        let tick = Duration::from_secs(1);
        let mut remaining = duration;

        loop {
            if *shutdown.borrow() {
                debug!("careful sleep: got termination signal");
                return false;
            }

            if remaining.is_zero() {
                return true;
            }

            let step = remaining.min(tick);
            remaining = remaining.saturating_sub(step);

            tokio::select! {
                _ = sleep(step) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return false;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn carefully_sleep_returns_false_immediately_if_already_shut_down() {
        let (_tx, rx) = watch::channel(true);
        let mut rx = rx;
        let completed = TunnelSupervisor::carefully_sleep(Duration::from_secs(5), &mut rx).await;
        assert!(!completed);
    }

    #[tokio::test]
    async fn carefully_sleep_completes_when_never_signaled() {
        let (_tx, rx) = watch::channel(false);
        let mut rx = rx;
        let completed = TunnelSupervisor::carefully_sleep(Duration::from_millis(1), &mut rx).await;
        assert!(completed);
    }
}
