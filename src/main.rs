use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use agentvisor::approval::bridge::{self, BridgeState};
use agentvisor::approval::{ApprovalGate, ApprovalRule};
use agentvisor::config::{default_config_path, load_config, AppConfig};
use agentvisor::llm::ChatClient;
use agentvisor::queue::{
    AgentTaskRunner, QueuedTask, TaskPriority, TaskQueueManager, TaskStatus,
};
use agentvisor::store::JsonFileStore;
use agentvisor::tools::{ShellTool, ToolExecutor, ToolRegistry};
use agentvisor::tracing::{init_tracing, shutdown_tracing};
use agentvisor::vm::{QemuBackend, VmSession};

#[derive(Parser)]
#[command(name = "agentvisor", version, about = "Coding agents with gated tools and a sandboxed shell")]
struct Cli {
    /// Config file (defaults to ~/.agentvisor/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Export traces to this OTLP endpoint
    #[arg(long, global = true)]
    otlp_endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one task through the queue
    Run {
        task: String,
        /// Project directory the agent works in
        #[arg(long)]
        cwd: Option<PathBuf>,
        #[arg(long, default_value = "normal")]
        priority: TaskPriority,
        /// Split the task into parallel subtasks first
        #[arg(long)]
        decompose: bool,
        /// Also serve approvals over HTTP
        #[arg(long)]
        bridge: bool,
    },
    /// Serve the approval bridge, answering requests on stdin
    Bridge {
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
    /// Boot the VM, run one command and stop it
    VmExec {
        command: String,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if let Err(e) = init_tracing("agentvisor", cli.otlp_endpoint.as_deref()) {
        eprintln!("Failed to initialize tracing: {}", e);
    }

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = load_config(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let result = match cli.command {
        Command::Run {
            task,
            cwd,
            priority,
            decompose,
            bridge,
        } => run_task(&config, task, cwd, priority, decompose, bridge).await,
        Command::Bridge { addr } => serve_bridge(&config, addr).await,
        Command::VmExec {
            command,
            timeout_secs,
        } => vm_exec(&config, &command, timeout_secs).await,
    };

    shutdown_tracing();
    result
}

fn approval_gate(config: &AppConfig) -> Arc<ApprovalGate> {
    let rules = JsonFileStore::<Vec<ApprovalRule>>::in_dir(&config.data_dir, "rules");
    Arc::new(ApprovalGate::with_store(Box::new(rules)))
}

fn vm_session(config: &AppConfig) -> Option<Arc<VmSession>> {
    config
        .vm
        .enabled
        .then(|| VmSession::new(config.vm.clone(), Arc::new(QemuBackend::new())))
}

async fn run_task(
    config: &AppConfig,
    description: String,
    cwd: Option<PathBuf>,
    priority: TaskPriority,
    decompose: bool,
    with_bridge: bool,
) -> anyhow::Result<()> {
    let cwd = match cwd {
        Some(dir) => dir,
        None => std::env::current_dir().context("reading current directory")?,
    };
    let cwd = std::fs::canonicalize(&cwd).with_context(|| format!("resolving {}", cwd.display()))?;

    let provider = Arc::new(ChatClient::from_config(&config.llm)?);
    let gate = approval_gate(config);
    spawn_stdin_approver(gate.clone());
    if with_bridge {
        spawn_bridge(config, gate.clone(), None)?;
    }

    let registry = ToolRegistry::new().with(Arc::new(ShellTool::with_default_timeout(
        config.vm.command_timeout_secs,
    )));
    let executor = Arc::new(
        ToolExecutor::new(registry, gate)
            .with_max_output_bytes(config.agent.max_tool_output_bytes)
            .with_approval_timeout(Duration::from_secs(config.approval.request_timeout_secs)),
    );
    let vm = vm_session(config);
    let runner = AgentTaskRunner::new(
        provider,
        executor,
        config.agent.clone(),
        config.scheduler.clone(),
    )
    .with_vm(vm.clone());

    let queue = TaskQueueManager::with_stores(
        Arc::new(runner),
        config.queue.clone(),
        Box::new(JsonFileStore::<Vec<QueuedTask>>::in_dir(&config.data_dir, "queue")),
        Box::new(JsonFileStore::<Vec<QueuedTask>>::in_dir(&config.data_dir, "history")),
    );
    let id = queue.enqueue(
        QueuedTask::new(description, cwd)
            .with_priority(priority)
            .with_decomposition(decompose),
    );
    info!(task_id = %id, "Waiting for task");

    let finished = tokio::select! {
        finished = queue.wait_for(id) => finished,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling task");
            queue.cancel(id);
            queue.wait_for(id).await
        }
    };

    if let Some(vm) = vm {
        if let Err(e) = vm.stop().await {
            warn!(error = %e, "Failed to stop VM");
        }
    }

    let Some(task) = finished else {
        bail!("task {} was removed before it ran", id);
    };
    match task.status {
        TaskStatus::Completed => {
            println!("{}", task.result.unwrap_or_default());
            Ok(())
        }
        status => bail!(
            "task {}: {}",
            status.as_str(),
            task.error.unwrap_or_else(|| "no error recorded".into())
        ),
    }
}

async fn serve_bridge(config: &AppConfig, addr: Option<SocketAddr>) -> anyhow::Result<()> {
    let gate = approval_gate(config);
    spawn_stdin_approver(gate.clone());
    let handle = spawn_bridge(config, gate, addr)?;
    tokio::select! {
        result = handle => result??,
        _ = tokio::signal::ctrl_c() => info!("Shutting down bridge"),
    }
    Ok(())
}

fn spawn_bridge(
    config: &AppConfig,
    gate: Arc<ApprovalGate>,
    addr: Option<SocketAddr>,
) -> anyhow::Result<tokio::task::JoinHandle<std::io::Result<()>>> {
    let addr = match addr {
        Some(addr) => addr,
        None => config
            .approval
            .bridge_addr
            .parse()
            .with_context(|| format!("invalid bridge address {}", config.approval.bridge_addr))?,
    };
    let state = BridgeState {
        gate,
        request_timeout: Duration::from_secs(config.approval.request_timeout_secs),
    };
    Ok(tokio::spawn(bridge::serve(addr, state)))
}

/// Prompt for each pending approval: y = once, a = always, anything else denies
fn spawn_stdin_approver(gate: Arc<ApprovalGate>) {
    let mut requests = gate.subscribe();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let request = match requests.recv().await {
                Ok(request) => request,
                Err(RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Approval prompts fell behind");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            // Already resolved elsewhere (bridge or another prompt)
            if !gate.pending().iter().any(|r| r.id == request.id) {
                continue;
            }
            eprintln!(
                "\n{} wants to run in {}:\n  {}\nAllow? [y]es / [n]o / [a]lways: ",
                request.tool_name,
                request.working_directory.display(),
                request.args
            );
            let answer = match lines.next_line().await {
                Ok(Some(line)) => line.trim().to_ascii_lowercase(),
                _ => break,
            };
            let result = match answer.as_str() {
                "y" | "yes" => gate.approve(request.id, false),
                "a" | "always" => gate.approve(request.id, true),
                _ => gate.deny(request.id, "denied by user"),
            };
            if let Err(e) = result {
                warn!(error = %e, "Approval was already resolved");
            }
        }
    });
}

async fn vm_exec(config: &AppConfig, command: &str, timeout_secs: Option<u64>) -> anyhow::Result<()> {
    if !config.vm.enabled {
        bail!("vm.enabled is false in the configuration");
    }
    let session = VmSession::new(config.vm.clone(), Arc::new(QemuBackend::new()));
    session.start().await.context("starting VM")?;

    let timeout = Duration::from_secs(timeout_secs.unwrap_or(config.vm.command_timeout_secs));
    let cwd = std::env::current_dir().ok();
    let guest_dir = cwd
        .as_deref()
        .and_then(|dir| session.shared_folders().to_guest(dir));
    let result = session
        .execute(command, timeout, guest_dir.as_deref())
        .await;
    if let Err(e) = session.stop().await {
        warn!(error = %e, "Failed to stop VM");
    }

    let result = result.context("running command")?;
    print!("{}", result.output);
    if result.timed_out {
        bail!("command timed out after {:?}", timeout);
    }
    if result.exit_code != 0 {
        bail!("command exited with {}", result.exit_code);
    }
    Ok(())
}
