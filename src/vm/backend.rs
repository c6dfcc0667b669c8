//! Hypervisor backends
//!
//! A [`VmBackend`] boots a guest and hands back a [`GuestMachine`] whose
//! serial console the session drives. The shipped backend runs QEMU; tests
//! plug in an in-memory guest.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Child;
use tracing::{info, warn};
use uuid::Uuid;

use super::lifecycle::{kill_process_group, spawn_qemu, wait_for_socket};
use super::qmp::QmpClient;
use super::{VmConfig, VmError};

/// Serial console of a running guest
pub struct Console {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

/// A booted guest
#[async_trait]
pub trait GuestMachine: Send {
    /// Hand over the console; `None` once taken
    fn take_console(&mut self) -> Option<Console>;
    async fn pause(&mut self) -> Result<(), VmError>;
    async fn resume(&mut self) -> Result<(), VmError>;
    /// Stop the guest and release its resources
    async fn shutdown(&mut self) -> Result<(), VmError>;
}

/// Something that can boot guests from a [`VmConfig`]
#[async_trait]
pub trait VmBackend: Send + Sync {
    async fn boot(&self, config: &VmConfig) -> Result<Box<dyn GuestMachine>, VmError>;
}

/// QEMU backend: serial console on stdio, control over QMP
#[derive(Debug, Default, Clone)]
pub struct QemuBackend;

impl QemuBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl VmBackend for QemuBackend {
    async fn boot(&self, config: &VmConfig) -> Result<Box<dyn GuestMachine>, VmError> {
        if !config.kernel_path.exists() {
            return Err(VmError::Config(format!(
                "kernel not found at {}",
                config.kernel_path.display()
            )));
        }
        if let Some(rootfs) = &config.rootfs_path {
            if !rootfs.exists() {
                return Err(VmError::Config(format!(
                    "rootfs not found at {}",
                    rootfs.display()
                )));
            }
        }

        let runtime_dir = config
            .runtime_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        std::fs::create_dir_all(&runtime_dir)?;
        let qmp_socket = runtime_dir.join(format!("agentvisor-{}.qmp", Uuid::now_v7().simple()));

        let mut child = spawn_qemu(config, &qmp_socket)?;
        let pid = child.id();
        let mut machine = QemuMachine {
            console: None,
            child: None,
            pid,
            qmp: None,
            qmp_socket,
        };

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                machine.child = Some(child);
                machine.force_kill();
                return Err(VmError::ConsoleUnavailable);
            }
        };
        machine.child = Some(child);
        machine.console = Some(Console {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
        });

        // On error `machine` drops here and kills the process group
        wait_for_socket(
            &machine.qmp_socket,
            Duration::from_secs(config.startup_timeout_secs),
        )
        .await?;
        machine.qmp = Some(QmpClient::connect(&machine.qmp_socket).await?);

        info!(pid = ?pid, "QEMU guest booting");
        Ok(Box::new(machine))
    }
}

/// A running QEMU process
pub struct QemuMachine {
    console: Option<Console>,
    child: Option<Child>,
    pid: Option<u32>,
    qmp: Option<QmpClient>,
    qmp_socket: PathBuf,
}

impl QemuMachine {
    fn qmp(&mut self) -> Result<&mut QmpClient, VmError> {
        self.qmp
            .as_mut()
            .ok_or_else(|| VmError::Qmp("not connected".into()))
    }

    fn force_kill(&mut self) {
        let running = self
            .child
            .as_mut()
            .map(|c| matches!(c.try_wait(), Ok(None)))
            .unwrap_or(false);
        if running {
            if let Some(pid) = self.pid {
                if let Err(e) = kill_process_group(pid) {
                    warn!(pid, error = %e, "Failed to kill QEMU process group");
                }
            }
        }
        let _ = std::fs::remove_file(&self.qmp_socket);
    }
}

#[async_trait]
impl GuestMachine for QemuMachine {
    fn take_console(&mut self) -> Option<Console> {
        self.console.take()
    }

    async fn pause(&mut self) -> Result<(), VmError> {
        self.qmp()?.stop().await
    }

    async fn resume(&mut self) -> Result<(), VmError> {
        self.qmp()?.cont().await
    }

    async fn shutdown(&mut self) -> Result<(), VmError> {
        if let Some(qmp) = self.qmp.as_mut() {
            // QEMU may close the socket before replying to quit
            if let Err(e) = qmp.quit().await {
                warn!(error = %e, "QMP quit failed, killing process group");
            }
        }
        self.qmp = None;

        if let Some(child) = self.child.as_mut() {
            match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
                Ok(Ok(status)) => info!(%status, "QEMU exited"),
                _ => {
                    self.force_kill();
                    if let Some(child) = self.child.as_mut() {
                        let _ = child.wait().await;
                    }
                }
            }
        }
        self.child = None;
        let _ = std::fs::remove_file(&self.qmp_socket);
        Ok(())
    }
}

impl Drop for QemuMachine {
    fn drop(&mut self) {
        self.force_kill();
    }
}
