//! VM session lifecycle and command channel against the in-memory guest

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use agentvisor::test_support::FakeBackend;
use agentvisor::vm::session::TIMEOUT_EXIT_CODE;
use agentvisor::vm::{VmConfig, VmError, VmSession, VmState};

fn config() -> VmConfig {
    VmConfig {
        enabled: true,
        startup_timeout_secs: 10,
        command_timeout_secs: 30,
        ..VmConfig::default()
    }
}

async fn started(config: VmConfig) -> (Arc<VmSession>, FakeBackend) {
    let backend = FakeBackend::new();
    let session = VmSession::new(config, Arc::new(backend.clone()));
    session.start().await.unwrap();
    (session, backend)
}

const T: Duration = Duration::from_secs(10);

#[tokio::test(start_paused = true)]
async fn test_start_and_execute() {
    let (session, backend) = started(config()).await;
    assert_eq!(session.state(), VmState::Running);

    let ok = session.execute("echo hello", T, None).await.unwrap();
    assert_eq!(ok.output.trim(), "hello");
    assert_eq!(ok.exit_code, 0);
    assert!(!ok.timed_out);

    let failed = session.execute("exit 3", T, None).await.unwrap();
    assert_eq!(failed.exit_code, 3);

    assert_eq!(backend.guest().boots.load(Ordering::SeqCst), 1);
    session.stop().await.unwrap();
    assert_eq!(session.state(), VmState::Stopped);
    assert_eq!(backend.guest().shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_execute_requires_running() {
    let session = VmSession::new(config(), Arc::new(FakeBackend::new()));
    let err = session.execute("true", T, None).await.unwrap_err();
    assert!(matches!(err, VmError::NotRunning(VmState::Stopped)));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_commands_are_serialized_fifo() {
    let (session, backend) = started(config()).await;

    let (a, b, c) = tokio::join!(
        session.execute("echo a", T, None),
        session.execute("echo b", T, None),
        session.execute("echo c", T, None),
    );
    assert_eq!(a.unwrap().output.trim(), "a");
    assert_eq!(b.unwrap().output.trim(), "b");
    assert_eq!(c.unwrap().output.trim(), "c");

    let commands = backend.guest().commands();
    let tail: Vec<&str> = commands[commands.len() - 3..]
        .iter()
        .map(String::as_str)
        .collect();
    assert_eq!(tail, vec!["echo a", "echo b", "echo c"]);
    assert_eq!(session.pending_commands(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_interrupts_and_channel_recovers() {
    let (session, _backend) = started(config()).await;

    let result = session
        .execute("sleep 600", Duration::from_secs(2), None)
        .await
        .unwrap();
    assert!(result.timed_out);
    assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
    assert_eq!(session.state(), VmState::Running);

    let next = session.execute("echo still-here", T, None).await.unwrap();
    assert_eq!(next.output.trim(), "still-here");
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_guest_after_timeout_is_error() {
    let (session, _backend) = started(config()).await;

    let result = session
        .execute("hang", Duration::from_secs(1), None)
        .await
        .unwrap();
    assert!(result.timed_out);
    assert_eq!(session.state(), VmState::Error);
    assert!(matches!(
        session.execute("true", T, None).await,
        Err(VmError::NotRunning(VmState::Error))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_guest_crash_reports_exit() {
    let (session, backend) = started(config()).await;

    let err = session.execute("crash", T, None).await.unwrap_err();
    assert!(matches!(err, VmError::GuestExited));
    assert_eq!(session.state(), VmState::Error);

    // A new start recovers from the error state
    session.start().await.unwrap();
    assert_eq!(session.state(), VmState::Running);
    assert_eq!(backend.guest().boots.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_startup_timeout() {
    let backend = FakeBackend::new();
    backend.guest().silent.store(true, Ordering::SeqCst);
    let session = VmSession::new(
        VmConfig {
            startup_timeout_secs: 3,
            ..config()
        },
        Arc::new(backend.clone()),
    );

    let err = session.start().await.unwrap_err();
    assert!(matches!(err, VmError::StartupTimeout(_)));
    assert_eq!(session.state(), VmState::Error);
    assert_eq!(backend.guest().shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_boot_failure_is_error_state() {
    let backend = FakeBackend::new();
    backend.guest().fail_boot.store(true, Ordering::SeqCst);
    let session = VmSession::new(config(), Arc::new(backend));

    assert!(session.start().await.is_err());
    assert_eq!(session.state(), VmState::Error);
}

#[tokio::test(start_paused = true)]
async fn test_pause_and_resume() {
    let (session, backend) = started(config()).await;

    session.pause().await.unwrap();
    assert_eq!(session.state(), VmState::Paused);
    assert!(matches!(
        session.execute("true", T, None).await,
        Err(VmError::NotRunning(VmState::Paused))
    ));
    assert!(matches!(
        session.pause().await,
        Err(VmError::NotRunning(VmState::Paused))
    ));

    session.ensure_running().await.unwrap();
    assert_eq!(session.state(), VmState::Running);
    assert_eq!(backend.guest().resumes.load(Ordering::SeqCst), 1);
    assert!(matches!(
        session.resume().await,
        Err(VmError::InvalidTransition { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_shared_folders_are_mounted_and_used_as_cwd() {
    let dir = tempfile::tempdir().unwrap();
    let (session, backend) = started(VmConfig {
        shared_folders: vec![dir.path().to_path_buf()],
        ..config()
    })
    .await;

    assert!(backend
        .guest()
        .commands()
        .iter()
        .any(|c| c.starts_with("mkdir -p /mnt/share0 && mount -t 9p")));

    let guest_dir = session
        .shared_folders()
        .to_guest(&dir.path().join("crate"))
        .unwrap();
    let result = session
        .execute("pwd", T, Some(&guest_dir))
        .await
        .unwrap();
    assert_eq!(result.output.trim(), "/mnt/share0/crate");
    assert_eq!(
        session.shared_folders().to_host(Path::new("/mnt/share0/crate")),
        Some(dir.path().join("crate"))
    );
}

fn warm_config() -> VmConfig {
    VmConfig {
        keep_warm: true,
        idle_timeout_secs: 10,
        idle_poll_secs: 1,
        command_timeout_secs: 120,
        ..config()
    }
}

#[tokio::test(start_paused = true)]
async fn test_idle_monitor_stops_idle_session() {
    let (session, backend) = started(warm_config()).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(session.state(), VmState::Running);

    tokio::time::sleep(Duration::from_secs(8)).await;
    assert_eq!(session.state(), VmState::Stopped);
    assert_eq!(backend.guest().shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_idle_monitor_waits_for_pending_command() {
    let (session, _backend) = started(warm_config()).await;

    let long = {
        let session = session.clone();
        tokio::spawn(async move {
            session
                .execute("sleep 30", Duration::from_secs(60), None)
                .await
        })
    };
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(session.pending_commands(), 1);
    assert_eq!(session.state(), VmState::Running);

    let result = long.await.unwrap().unwrap();
    assert_eq!(result.exit_code, 0);
    assert_eq!(session.state(), VmState::Running);

    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_eq!(session.state(), VmState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_keep_warm_off_never_stops() {
    let (session, _backend) = started(VmConfig {
        keep_warm: false,
        ..warm_config()
    })
    .await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(session.state(), VmState::Running);

    session.set_keep_warm(true);
    tokio::time::sleep(Duration::from_secs(2)).await;
    // Idle since boot, so the first poll stops it
    assert_eq!(session.state(), VmState::Stopped);
}
