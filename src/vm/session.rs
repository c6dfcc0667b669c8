//! Sandbox VM session: lifecycle state machine and serialized command channel
//!
//! One console worker task owns the guest's serial console. Commands reach it
//! through an mpsc queue, so they run strictly one at a time in arrival order,
//! and each caller gets its reply on a oneshot channel.
//!
//! ```text
//! Stopped ──start──▶ Starting ──shell ready + mounts──▶ Running ◀──resume── Paused
//!    ▲                   │                                 │  └──pause──▶───┘
//!    │                   └──────── boot failure ──▶ Error ◀┘ console EOF / desync
//!    └──────────── stop / idle monitor ────────────────────┘
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use super::backend::{Console, GuestMachine, VmBackend};
use super::protocol::{new_marker, shell_quote, wrap, MarkerScanner};
use super::{VmConfig, VmError};
use crate::metrics::{VM_BOOT_DURATION, VM_COMMANDS, VM_COMMAND_DURATION};

/// Exit code reported for commands that hit their timeout
pub const TIMEOUT_EXIT_CODE: i32 = 124;

const PROBE_INTERVAL: Duration = Duration::from_millis(500);
const INTERRUPT_GRACE: Duration = Duration::from_secs(5);
const SHELL_INIT: &[u8] = b"export PS1=''; export PS2=''; stty -echo\n";

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    Stopped,
    Starting,
    Running,
    Paused,
    Error,
}

/// Result of one guest command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Combined output with `\r\n` folded to `\n`
    pub output: String,
    pub exit_code: i32,
    pub duration: Duration,
    pub timed_out: bool,
}

/// Host directories exported to the guest, `host[i] ↔ /mnt/share{i}`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SharedFolders {
    hosts: Vec<PathBuf>,
}

impl SharedFolders {
    pub fn new(hosts: Vec<PathBuf>) -> Self {
        Self { hosts }
    }

    pub fn guest_mount(index: usize) -> PathBuf {
        PathBuf::from(format!("/mnt/share{}", index))
    }

    pub fn hosts(&self) -> &[PathBuf] {
        &self.hosts
    }

    /// Guest path for a host path, `None` outside every share
    pub fn to_guest(&self, host: &Path) -> Option<PathBuf> {
        self.hosts.iter().enumerate().find_map(|(i, root)| {
            host.strip_prefix(root)
                .ok()
                .map(|rest| Self::guest_mount(i).join(rest))
        })
    }

    /// Host path for a guest path, `None` outside every mount
    pub fn to_host(&self, guest: &Path) -> Option<PathBuf> {
        self.hosts.iter().enumerate().find_map(|(i, root)| {
            guest
                .strip_prefix(Self::guest_mount(i))
                .ok()
                .map(|rest| root.join(rest))
        })
    }
}

struct CommandRequest {
    command: String,
    timeout: Duration,
    reply: oneshot::Sender<Result<CommandResult, VmError>>,
}

#[derive(Default)]
struct Lifecycle {
    machine: Option<Box<dyn GuestMachine>>,
    worker: Option<JoinHandle<()>>,
}

/// Counts a command as pending for as long as it lives
struct PendingGuard<'a> {
    session: &'a VmSession,
}

impl<'a> PendingGuard<'a> {
    fn new(session: &'a VmSession) -> Self {
        session.pending.fetch_add(1, Ordering::SeqCst);
        session.touch();
        Self { session }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.session.touch();
        self.session.pending.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A sandbox VM and its command channel
pub struct VmSession {
    config: VmConfig,
    backend: Arc<dyn VmBackend>,
    shared: SharedFolders,
    state: Arc<Mutex<VmState>>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    commands: Mutex<Option<mpsc::Sender<CommandRequest>>>,
    pending: AtomicUsize,
    last_activity: Mutex<Instant>,
    keep_warm: AtomicBool,
    idle_monitor: Mutex<Option<JoinHandle<()>>>,
    this: Weak<VmSession>,
}

impl VmSession {
    pub fn new(config: VmConfig, backend: Arc<dyn VmBackend>) -> Arc<Self> {
        let keep_warm = config.keep_warm;
        Arc::new_cyclic(|this| Self {
            shared: config.shared(),
            config,
            backend,
            state: Arc::new(Mutex::new(VmState::Stopped)),
            lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
            commands: Mutex::new(None),
            pending: AtomicUsize::new(0),
            last_activity: Mutex::new(Instant::now()),
            keep_warm: AtomicBool::new(keep_warm),
            idle_monitor: Mutex::new(None),
            this: this.clone(),
        })
    }

    pub fn state(&self) -> VmState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: VmState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn shared_folders(&self) -> &SharedFolders {
        &self.shared
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Commands currently queued or running
    pub fn pending_commands(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    /// Boot the guest, wait for its shell and mount the shared folders
    pub async fn start(&self) -> Result<(), VmError> {
        let mut lifecycle = self.lifecycle.lock().await;
        match self.state() {
            VmState::Running => return Ok(()),
            VmState::Paused => return self.resume_locked(&mut lifecycle).await,
            VmState::Error => {
                // Leftovers from a crashed guest
                let _ = self.teardown(&mut lifecycle, true).await;
            }
            VmState::Stopped | VmState::Starting => {}
        }

        self.set_state(VmState::Starting);
        let started = Instant::now();
        let startup_timeout = Duration::from_secs(self.config.startup_timeout_secs);
        let span = info_span!("vm_boot", otel.name = "vm_boot");
        let booted = tokio::time::timeout(startup_timeout, self.boot(&mut lifecycle))
            .instrument(span)
            .await
            .unwrap_or(Err(VmError::StartupTimeout(startup_timeout)));

        match booted {
            Ok(()) => {
                VM_BOOT_DURATION.observe(started.elapsed().as_secs_f64());
                self.touch();
                self.set_state(VmState::Running);
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "VM running");
                if self.keep_warm.load(Ordering::SeqCst) {
                    self.spawn_idle_monitor();
                }
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "VM failed to start");
                let _ = self.teardown(&mut lifecycle, true).await;
                self.set_state(VmState::Error);
                Err(e)
            }
        }
    }

    async fn boot(&self, lifecycle: &mut Lifecycle) -> Result<(), VmError> {
        let mut machine = self.backend.boot(&self.config).await?;
        let console = machine.take_console();
        lifecycle.machine = Some(machine);
        let mut console = console.ok_or(VmError::ConsoleUnavailable)?;

        wait_for_shell(&mut console).await?;
        console.writer.write_all(SHELL_INIT).await?;
        console.writer.flush().await?;

        let (tx, rx) = mpsc::channel(32);
        lifecycle.worker = Some(tokio::spawn(console_worker(
            console,
            rx,
            self.state.clone(),
        )));
        *self.commands.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx.clone());

        let timeout = Duration::from_secs(self.config.command_timeout_secs);
        // Round-trip once so the init line's output is drained
        send_command(&tx, "true".to_string(), timeout).await?;

        for i in 0..self.shared.hosts().len() {
            let mount = SharedFolders::guest_mount(i);
            let mount = mount.display();
            let command = format!(
                "mkdir -p {mount} && mount -t 9p -o trans=virtio,version=9p2000.L share{i} {mount}"
            );
            let result = send_command(&tx, command, timeout).await?;
            if result.exit_code != 0 {
                return Err(VmError::MountFailed {
                    index: i,
                    output: result.output,
                });
            }
            debug!(index = i, "Mounted shared folder");
        }
        Ok(())
    }

    /// Start on demand; resumes a paused guest
    pub async fn ensure_running(&self) -> Result<(), VmError> {
        if self.state() == VmState::Running {
            return Ok(());
        }
        self.start().await
    }

    /// Run `command` in the guest, optionally inside `working_directory`
    pub async fn execute(
        &self,
        command: &str,
        timeout: Duration,
        working_directory: Option<&Path>,
    ) -> Result<CommandResult, VmError> {
        // Counted before admission so the idle monitor cannot miss it
        let _pending = PendingGuard::new(self);
        let tx = self.admit()?;
        let command = match working_directory {
            Some(dir) => format!("cd {} && {}", shell_quote(&dir.to_string_lossy()), command),
            None => command.to_string(),
        };

        let result = send_command(&tx, command, timeout).await;
        let status = match &result {
            Ok(r) if r.timed_out => "timeout",
            Ok(r) if r.exit_code == 0 => "success",
            Ok(_) => "failed",
            Err(_) => "error",
        };
        VM_COMMANDS.with_label_values(&[status]).inc();
        if let Ok(r) = &result {
            VM_COMMAND_DURATION
                .with_label_values(&[status])
                .observe(r.duration.as_secs_f64());
        }
        result
    }

    /// Sender for a new command while running
    ///
    /// Serialised with [`VmSession::close_if_idle`] by the state lock.
    fn admit(&self) -> Result<mpsc::Sender<CommandRequest>, VmError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != VmState::Running {
            return Err(VmError::NotRunning(*state));
        }
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(VmError::NotRunning(VmState::Stopped))
    }

    /// Close the command channel if the session is running, idle and has
    /// nothing pending; commands admitted earlier keep it open
    fn close_if_idle(&self, idle_timeout: Duration) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != VmState::Running
            || self.pending_commands() > 0
            || self.idle_for() < idle_timeout
        {
            return false;
        }
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        true
    }

    /// Shut the guest down immediately
    pub async fn stop(&self) -> Result<(), VmError> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.teardown(&mut lifecycle, true).await
    }

    /// Wait up to `timeout` for pending commands to drain, then stop
    pub async fn graceful_stop(&self, timeout: Duration) -> Result<(), VmError> {
        let drained = tokio::time::timeout(timeout, async {
            while self.pending_commands() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                pending = self.pending_commands(),
                "Stopping VM with commands still pending"
            );
        }
        self.stop().await
    }

    pub async fn pause(&self) -> Result<(), VmError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let state = self.state();
        if state != VmState::Running {
            return Err(VmError::NotRunning(state));
        }
        let machine = lifecycle
            .machine
            .as_mut()
            .ok_or(VmError::NotRunning(state))?;
        machine.pause().await?;
        self.set_state(VmState::Paused);
        info!("VM paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), VmError> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.resume_locked(&mut lifecycle).await
    }

    async fn resume_locked(&self, lifecycle: &mut Lifecycle) -> Result<(), VmError> {
        let state = self.state();
        if state != VmState::Paused {
            return Err(VmError::InvalidTransition {
                from: state,
                to: VmState::Running,
            });
        }
        let machine = lifecycle
            .machine
            .as_mut()
            .ok_or(VmError::NotRunning(state))?;
        machine.resume().await?;
        self.touch();
        self.set_state(VmState::Running);
        info!("VM resumed");
        Ok(())
    }

    /// Toggle the idle monitor
    pub fn set_keep_warm(&self, enabled: bool) {
        self.keep_warm.store(enabled, Ordering::SeqCst);
        if enabled {
            if self.state() == VmState::Running {
                self.spawn_idle_monitor();
            }
        } else if let Some(handle) = self.take_idle_monitor() {
            handle.abort();
        }
    }

    fn take_idle_monitor(&self) -> Option<JoinHandle<()>> {
        self.idle_monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn spawn_idle_monitor(&self) {
        let mut slot = self.idle_monitor.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let poll = Duration::from_secs(self.config.idle_poll_secs.max(1));
        *slot = Some(tokio::spawn(idle_monitor(self.this.clone(), poll)));
    }

    /// Release the machine and worker; `abort_monitor` is false when the idle
    /// monitor itself is stopping the session
    async fn teardown(&self, lifecycle: &mut Lifecycle, abort_monitor: bool) -> Result<(), VmError> {
        if abort_monitor {
            if let Some(handle) = self.take_idle_monitor() {
                handle.abort();
            }
        }
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(worker) = lifecycle.worker.take() {
            worker.abort();
        }
        let result = match lifecycle.machine.take() {
            Some(mut machine) => machine.shutdown().await,
            None => Ok(()),
        };
        self.set_state(VmState::Stopped);
        info!("VM stopped");
        result
    }
}

/// Stops the session once it has been idle for `idle_timeout`
async fn idle_monitor(session: Weak<VmSession>, poll: Duration) {
    loop {
        tokio::time::sleep(poll).await;
        let Some(session) = session.upgrade() else {
            return;
        };
        if !session.keep_warm.load(Ordering::SeqCst) || session.state() != VmState::Running {
            return;
        }
        let idle_timeout = Duration::from_secs(session.config.idle_timeout_secs);
        if session.pending_commands() > 0 || session.idle_for() < idle_timeout {
            continue;
        }

        let mut lifecycle = session.lifecycle.lock().await;
        if session.close_if_idle(idle_timeout) {
            info!(idle_secs = session.idle_for().as_secs(), "Stopping idle VM");
            drop(session.take_idle_monitor());
            if let Err(e) = session.teardown(&mut lifecycle, false).await {
                warn!(error = %e, "Idle shutdown failed");
            }
            return;
        }
    }
}

async fn send_command(
    tx: &mpsc::Sender<CommandRequest>,
    command: String,
    timeout: Duration,
) -> Result<CommandResult, VmError> {
    let (reply, rx) = oneshot::channel();
    tx.send(CommandRequest {
        command,
        timeout,
        reply,
    })
    .await
    .map_err(|_| VmError::ConsoleClosed)?;
    rx.await.map_err(|_| VmError::ConsoleClosed)?
}

/// Write `echo ready` until the guest prints a `ready` line
async fn wait_for_shell(console: &mut Console) -> Result<(), VmError> {
    let mut line = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        console.writer.write_all(b"echo ready\n").await?;
        console.writer.flush().await?;

        let deadline = Instant::now() + PROBE_INTERVAL;
        loop {
            let n = match tokio::time::timeout_at(deadline, console.reader.read(&mut chunk)).await {
                Err(_) => break,
                Ok(read) => read?,
            };
            if n == 0 {
                return Err(VmError::GuestExited);
            }
            for &byte in &chunk[..n] {
                if byte == b'\n' {
                    if String::from_utf8_lossy(&line).trim() == "ready" {
                        return Ok(());
                    }
                    line.clear();
                } else {
                    line.push(byte);
                }
            }
        }
    }
}

enum Outcome {
    Done(CommandResult),
    /// Reply sent but the console is unusable afterwards
    Desynced(CommandResult),
    Failed(VmError),
}

/// Owns the console; runs queued commands one at a time
async fn console_worker(
    mut console: Console,
    mut requests: mpsc::Receiver<CommandRequest>,
    state: Arc<Mutex<VmState>>,
) {
    let set_error = || *state.lock().unwrap_or_else(|e| e.into_inner()) = VmState::Error;

    while let Some(request) = requests.recv().await {
        match run_command(&mut console, &request.command, request.timeout).await {
            Outcome::Done(result) => {
                let _ = request.reply.send(Ok(result));
            }
            Outcome::Desynced(result) => {
                warn!("Console did not recover after interrupt");
                set_error();
                let _ = request.reply.send(Ok(result));
                return;
            }
            Outcome::Failed(e) => {
                warn!(error = %e, "Console failed");
                set_error();
                let _ = request.reply.send(Err(e));
                // Everything still queued sees the same failure
                requests.close();
                while let Some(queued) = requests.recv().await {
                    let _ = queued.reply.send(Err(VmError::GuestExited));
                }
                return;
            }
        }
    }
}

async fn run_command(console: &mut Console, command: &str, timeout: Duration) -> Outcome {
    let marker = new_marker();
    let started = Instant::now();
    let line = format!("{}\n", wrap(command, &marker));
    if let Err(e) = write_line(console, line.as_bytes()).await {
        return Outcome::Failed(e);
    }

    let mut scanner = MarkerScanner::new(&marker);
    match tokio::time::timeout(timeout, read_until_marker(console, &mut scanner)).await {
        Ok(Ok((output, exit_code))) => Outcome::Done(CommandResult {
            output,
            exit_code,
            duration: started.elapsed(),
            timed_out: false,
        }),
        Ok(Err(e)) => Outcome::Failed(e),
        Err(_) => {
            debug!(command = %command, "Command timed out, interrupting");
            let result = CommandResult {
                output: scanner.partial_output(),
                exit_code: TIMEOUT_EXIT_CODE,
                duration: started.elapsed(),
                timed_out: true,
            };
            // ^C may abort the rest of the wrapped line, so sync on a new marker
            let drain_marker = new_marker();
            let drain = format!("\x03\necho \"{}_0\"\n", drain_marker);
            if let Err(e) = write_line(console, drain.as_bytes()).await {
                return Outcome::Failed(e);
            }
            let mut drain_scanner = MarkerScanner::new(&drain_marker);
            match tokio::time::timeout(
                INTERRUPT_GRACE,
                read_until_marker(console, &mut drain_scanner),
            )
            .await
            {
                Ok(Ok(_)) => Outcome::Done(result),
                Ok(Err(e)) => Outcome::Failed(e),
                Err(_) => Outcome::Desynced(result),
            }
        }
    }
}

async fn write_line(console: &mut Console, bytes: &[u8]) -> Result<(), VmError> {
    console.writer.write_all(bytes).await.map_err(eof_or_io)?;
    console.writer.flush().await.map_err(eof_or_io)
}

fn eof_or_io(e: std::io::Error) -> VmError {
    if e.kind() == std::io::ErrorKind::BrokenPipe {
        VmError::GuestExited
    } else {
        VmError::Io(e)
    }
}

async fn read_until_marker(
    console: &mut Console,
    scanner: &mut MarkerScanner,
) -> Result<(String, i32), VmError> {
    let mut chunk = [0u8; 4096];
    loop {
        let n = console.reader.read(&mut chunk).await.map_err(eof_or_io)?;
        if n == 0 {
            return Err(VmError::GuestExited);
        }
        if let Some(framed) = scanner.push(&chunk[..n]) {
            return Ok((framed.output, framed.exit_code));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_folder_translation() {
        let shared = SharedFolders::new(vec![
            PathBuf::from("/home/me/proj"),
            PathBuf::from("/data"),
        ]);
        assert_eq!(
            shared.to_guest(Path::new("/home/me/proj/src/lib.rs")),
            Some(PathBuf::from("/mnt/share0/src/lib.rs"))
        );
        assert_eq!(
            shared.to_guest(Path::new("/data")),
            Some(PathBuf::from("/mnt/share1"))
        );
        assert_eq!(
            shared.to_host(Path::new("/mnt/share1/x")),
            Some(PathBuf::from("/data/x"))
        );
    }

    #[test]
    fn test_translation_is_component_wise_and_fails_closed() {
        let shared = SharedFolders::new(vec![PathBuf::from("/home/me/proj")]);
        assert_eq!(shared.to_guest(Path::new("/home/me/project2/file")), None);
        assert_eq!(shared.to_guest(Path::new("/etc/passwd")), None);
        assert_eq!(shared.to_host(Path::new("/mnt/share10/x")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_close_waits_for_admitted_command() {
        use crate::test_support::FakeBackend;

        let session = VmSession::new(
            VmConfig {
                enabled: true,
                keep_warm: false,
                idle_timeout_secs: 10,
                startup_timeout_secs: 10,
                ..VmConfig::default()
            },
            Arc::new(FakeBackend::new()),
        );
        session.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(20)).await;
        let idle_timeout = Duration::from_secs(10);

        // A command counted but not yet admitted keeps the channel open
        session.pending.fetch_add(1, Ordering::SeqCst);
        assert!(!session.close_if_idle(idle_timeout));
        assert!(session.admit().is_ok());
        session.pending.fetch_sub(1, Ordering::SeqCst);

        assert!(session.close_if_idle(idle_timeout));
        assert!(matches!(
            session.admit(),
            Err(VmError::NotRunning(VmState::Stopped))
        ));
        session.stop().await.unwrap();
        assert!(matches!(
            session.execute("true", idle_timeout, None).await,
            Err(VmError::NotRunning(VmState::Stopped))
        ));
    }
}
