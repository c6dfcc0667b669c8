//! Sandboxed command channel
//!
//! This module provides:
//! - VM configuration and the QEMU command line
//! - QMP control client and process lifecycle helpers
//! - The marker-framed serial protocol
//! - [`VmSession`], the lifecycle state machine with a serialized console

pub mod backend;
pub mod config;
pub mod lifecycle;
pub mod protocol;
pub mod qmp;
pub mod session;

use std::time::Duration;

use thiserror::Error;

pub use backend::{Console, GuestMachine, QemuBackend, VmBackend};
pub use config::VmConfig;
pub use qmp::QmpClient;
pub use session::{CommandResult, SharedFolders, VmSession, VmState};

/// Error type for sandbox operations
#[derive(Debug, Error)]
pub enum VmError {
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("VM I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("QMP error: {0}")]
    Qmp(String),
    #[error("VM did not become ready within {0:?}")]
    StartupTimeout(Duration),
    #[error("VM is not running (state: {0:?})")]
    NotRunning(VmState),
    #[error("cannot move VM from {from:?} to {to:?}")]
    InvalidTransition { from: VmState, to: VmState },
    /// The console reached EOF: the hypervisor process is gone
    #[error("guest exited")]
    GuestExited,
    #[error("VM console is unavailable")]
    ConsoleUnavailable,
    #[error("VM console worker stopped")]
    ConsoleClosed,
    #[error("failed to mount shared folder {index}: {output}")]
    MountFailed { index: usize, output: String },
    #[error("VM configuration error: {0}")]
    Config(String),
}
