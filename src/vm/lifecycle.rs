//! QEMU process lifecycle
//!
//! Spawning the emulator in its own process group, waiting for the QMP
//! socket, and killing the whole group on a forced stop.

use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info};

use super::{VmConfig, VmError};

/// Spawn QEMU with the serial console on piped stdio
///
/// The child leads a new process group so helper processes die with it.
/// Its stderr is forwarded to the log.
pub fn spawn_qemu(config: &VmConfig, qmp_socket: &Path) -> Result<Child, VmError> {
    let mut std_cmd = std::process::Command::new(&config.qemu_binary);
    std_cmd
        .args(config.qemu_args(qmp_socket))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    let mut child = Command::from(std_cmd)
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| VmError::Spawn {
            binary: config.qemu_binary.clone(),
            source,
        })?;

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "agentvisor::qemu", "{}", line);
            }
        });
    }

    info!(pid = ?child.id(), binary = %config.qemu_binary, "Spawned QEMU");
    Ok(child)
}

/// Wait for the QMP socket to appear
pub async fn wait_for_socket(socket_path: &Path, timeout: Duration) -> Result<(), VmError> {
    let poll_interval = Duration::from_millis(50);
    let wait = async {
        while !socket_path.exists() {
            tokio::time::sleep(poll_interval).await;
        }
    };
    tokio::time::timeout(timeout, wait)
        .await
        .map_err(|_| VmError::StartupTimeout(timeout))
}

/// SIGKILL every process in the group led by `pid`
pub fn kill_process_group(pid: u32) -> Result<(), VmError> {
    let pid = i32::try_from(pid).map_err(|_| VmError::Config(format!("invalid pid {}", pid)))?;
    killpg(Pid::from_raw(pid), Signal::SIGKILL)
        .map_err(|e| VmError::Io(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_socket_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let err = wait_for_socket(&dir.path().join("never.sock"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, VmError::StartupTimeout(_)));
    }

    #[tokio::test]
    async fn test_wait_for_socket_ready() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ready.sock");
        std::fs::write(&path, "").unwrap();
        wait_for_socket(&path, Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let config = VmConfig {
            qemu_binary: "/nonexistent/qemu-system-none".to_string(),
            ..VmConfig::default()
        };
        let err = spawn_qemu(&config, Path::new("/tmp/x.qmp")).unwrap_err();
        assert!(matches!(err, VmError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_kill_process_group() {
        let mut std_cmd = std::process::Command::new("sleep");
        std_cmd.arg("30").process_group(0);
        let mut child = Command::from(std_cmd).spawn().unwrap();
        kill_process_group(child.id().unwrap()).unwrap();
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}
