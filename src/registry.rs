//! Process registry: owns every spawned `autossh`/`ssh` child process,
//! finds/kills processes by signature across the whole OS process table (not
//! only its own children — a crashed previous run's orphans must be
//! reachable too), and cleans up handles for children that already exited.

use std::collections::HashMap;

use sysinfo::{Pid, System};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{TunmanError, TunmanResult};
use crate::health::HealthValidator;

/// All processes this supervisor process has spawned, keyed by an opaque
/// handle id assigned at spawn time.
pub struct ProcessRegistry {
    procs: Mutex<HashMap<u64, Child>>,
    next_id: Mutex<u64>,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self {
            procs: Mutex::new(HashMap::new()),
            next_id: Mutex::new(0),
        }
    }

    /// Spawn `cmd` via `sh -c`. Waits a non-blocking 1s before registering,
    /// so a command that exits immediately (e.g. a malformed ssh invocation)
    /// never gets tracked as a live handle. Returns the handle id and the OS
    /// pid.
    pub async fn spawn(&self, cmd: &str) -> TunmanResult<(u64, u32)> {
        info!("spawning {cmd}");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()?;

        let pid = child.id().ok_or_else(|| {
            TunmanError::Spawn("spawned process has no pid (already exited)".to_string())
        })?;

        tokio::time::sleep(std::time::Duration::from_secs(1)).await;

        if let Ok(Some(status)) = child.try_wait() {
            return Err(TunmanError::Spawn(format!(
                "process for \"{cmd}\" exited immediately with status {status}"
            )));
        }

        let mut next_id = self.next_id.lock().await;
        let id = *next_id;
        *next_id += 1;
        drop(next_id);

        self.procs.lock().await.insert(id, child);
        Ok((id, pid))
    }

    /// Drain stdout/stderr from a spawned child without blocking past a
    /// short grace window (a 2-second cap, long enough to capture a startup
    /// failure message without stalling the caller).
    pub async fn communicate(&self, id: u64) -> (String, String) {
        let mut procs = self.procs.lock().await;
        let Some(child) = procs.get_mut(&id) else {
            return (String::new(), String::new());
        };

        let stdout = child
            .stdout
            .take()
            .map(|mut s| async move {
                use tokio::io::AsyncReadExt;
                let mut buf = String::new();
                let _ = tokio::time::timeout(
                    std::time::Duration::from_secs(2),
                    s.read_to_string(&mut buf),
                )
                .await;
                buf
            });

        let stderr = child
            .stderr
            .take()
            .map(|mut s| async move {
                use tokio::io::AsyncReadExt;
                let mut buf = String::new();
                let _ = tokio::time::timeout(
                    std::time::Duration::from_secs(2),
                    s.read_to_string(&mut buf),
                )
                .await;
                buf
            });

        let out = match stdout {
            Some(f) => f.await,
            None => String::new(),
        };
        let err = match stderr {
            Some(f) => f.await,
            None => String::new(),
        };

        (out, err)
    }

    /// Find a live process anywhere in the OS process table whose cmdline
    /// contains `signature` and looks like an ssh invocation.
    pub fn find_by_signature(signature: &str) -> Option<u32> {
        let mut system = System::new();
        system.refresh_all();

        for (pid, process) in system.processes() {
            let cmdline = process
                .cmd()
                .iter()
                .map(|s| s.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ");

            if cmdline.contains(signature) && cmdline.contains("ssh") {
                return Some(pid.as_u32());
            }
        }

        None
    }

    /// Kill every OS process (not just ones this registry spawned) whose
    /// cmdline matches `signature`.
    pub fn kill_by_signature(signature: &str) {
        if let Some(pid) = Self::find_by_signature(signature) {
            Self::kill_pid(pid);
        }
    }

    /// Give `pid` up to 1s to exit on its own, then send a kill signal
    /// regardless of whether it did.
    async fn wait_then_kill_pid(pid: u32) {
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;

        let mut system = System::new();
        system.refresh_all();

        if let Some(process) = system.process(Pid::from_u32(pid)) {
            if !process.kill() {
                warn!("failed to send kill signal to pid {pid}");
            } else {
                debug!("killed pid {pid}");
            }
        }
    }

    fn kill_pid(pid: u32) {
        let mut system = System::new();
        system.refresh_all();

        if let Some(process) = system.process(Pid::from_u32(pid)) {
            if !process.kill() {
                warn!("failed to send kill signal to pid {pid}");
            } else {
                debug!("killed pid {pid}");
            }
        }
    }

    /// Kill every registered child and every OS process matching any of
    /// `signatures`, used on shutdown. Each process is given a 1s grace
    /// period to exit on its own before the kill signal is sent.
    pub async fn close_all(&self, signatures: &[String]) {
        for signature in signatures {
            if let Some(pid) = HealthValidator::is_process_alive(signature) {
                info!("killing pid {pid} (signature match)");
                Self::wait_then_kill_pid(pid).await;
            }
        }

        let mut procs = self.procs.lock().await;
        for (id, child) in procs.iter_mut() {
            info!("killing registered handle {id}");

            let exited_on_its_own = matches!(
                tokio::time::timeout(std::time::Duration::from_secs(1), child.wait()).await,
                Ok(Ok(_))
            );

            if !exited_on_its_own {
                if let Err(e) = child.kill().await {
                    warn!("failed to kill registered handle {id}: {e}");
                }
            }
        }
        procs.clear();
    }

    /// Drop handles for children that have already exited, so shutdown
    /// doesn't attempt to kill dead pids.
    pub async fn clean_up_exited(&self) {
        let mut procs = self.procs.lock().await;
        let mut exited = Vec::new();

        for (id, child) in procs.iter_mut() {
            if let Ok(Some(_status)) = child.try_wait() {
                exited.push(*id);
            }
        }

        for id in exited {
            debug!("clean_up: freeing handle {id}");
            procs.remove(&id);
        }
    }

    pub async fn count(&self) -> usize {
        self.procs.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_and_count_tracks_registered_handles() {
        let registry = ProcessRegistry::new();
        let (id, pid) = registry.spawn("sleep 2").await.unwrap();
        assert!(pid > 0);
        assert_eq!(registry.count().await, 1);

        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        registry.clean_up_exited().await;
        assert_eq!(registry.count().await, 0);
        let _ = id;
    }

    #[tokio::test]
    async fn spawn_fails_for_a_command_that_exits_immediately() {
        let registry = ProcessRegistry::new();
        let result = registry.spawn("true").await;
        assert!(result.is_err());
        assert_eq!(registry.count().await, 0);
    }

    #[test]
    fn find_by_signature_returns_none_for_nonsense() {
        assert!(ProcessRegistry::find_by_signature("definitely-not-a-real-signature-xyz").is_none());
    }
}
