//! Conductor child-process supervision

use parking_lot::Mutex;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::error::{SpawnError, SpawnResult};

/// A running conductor process
///
/// Output lines are forwarded to the log as they arrive. The process is
/// killed when the supervisor is dropped.
pub struct ProcessSupervisor {
    binary: String,
    pid: Option<u32>,
    exit_code: Arc<Mutex<Option<i32>>>,
    kill_tx: Option<oneshot::Sender<()>>,
    monitor: Option<tokio::task::JoinHandle<()>>,
}

impl ProcessSupervisor {
    /// Launch `binary -c config_path`
    pub fn spawn(binary: &str, config_path: &Path) -> SpawnResult<Self> {
        match which::which(binary) {
            Ok(resolved) => debug!(binary, resolved = %resolved.display(), "resolved conductor binary"),
            Err(err) => warn!(binary, error = %err, "conductor binary not found on PATH"),
        }

        let mut child = Command::new(binary)
            .arg("-c")
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SpawnError::Launch {
                binary: binary.to_string(),
                source,
            })?;
        let pid = child.id();
        info!(binary, pid, config = %config_path.display(), "conductor started");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, true));
        }

        let exit_code: Arc<Mutex<Option<i32>>> = Arc::default();
        let (kill_tx, kill_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor(child, kill_rx, Arc::clone(&exit_code)));

        Ok(Self {
            binary: binary.to_string(),
            pid,
            exit_code,
            kill_tx: Some(kill_tx),
            monitor: Some(monitor),
        })
    }

    /// OS process id, if the process was still running at spawn time
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit code once the process has ended
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    /// Kill the process and wait for it to be reaped
    pub async fn kill(&mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        if let Some(monitor) = self.monitor.take()
            && let Err(err) = monitor.await
        {
            warn!(binary = %self.binary, error = %err, "conductor monitor task failed");
        }
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(stream: R, is_stderr: bool) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            error!("!C! {line}");
        } else {
            info!("[C] {line}");
        }
    }
}

async fn monitor(mut child: Child, kill_rx: oneshot::Receiver<()>, exit_code: Arc<Mutex<Option<i32>>>) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Err(err) = child.start_kill() {
                warn!(error = %err, "failed to signal conductor");
            }
            child.wait().await
        }
    };
    match status {
        Ok(status) => {
            let code = status.code().unwrap_or(-1);
            *exit_code.lock() = Some(code);
            info!(code, "conductor exited with code {code}");
        }
        Err(err) => error!(error = %err, "failed to wait for conductor"),
    }
}
