//! Scripted fakes for tests: an LLM provider and an in-memory VM guest
//!
//! Enabled with the `test-support` feature (and always under `cfg(test)`).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

use crate::llm::{Completion, LlmError, LlmProvider, Message, ToolCall, ToolDefinition};
use crate::vm::{Console, GuestMachine, VmBackend, VmConfig, VmError};

type Responder = Box<dyn Fn(&[Message]) -> Result<Completion, LlmError> + Send + Sync>;

/// LLM provider that replays queued responses
///
/// When the queue runs dry it answers with the fallback responder if one is
/// set, otherwise with [`LlmError::EmptyResponse`].
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<Completion, String>>>,
    fallback: Option<Responder>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<Completion>) -> Self {
        Self {
            script: Mutex::new(responses.into_iter().map(Ok).collect()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answer every call by inspecting the conversation
    pub fn from_fn<F>(responder: F) -> Self
    where
        F: Fn(&[Message]) -> Result<Completion, LlmError> + Send + Sync + 'static,
    {
        Self {
            fallback: Some(Box::new(responder)),
            ..Self::new(Vec::new())
        }
    }

    /// Return the same completion forever
    pub fn repeating(completion: Completion) -> Self {
        Self::from_fn(move |_| Ok(completion.clone()))
    }

    pub fn push(&self, completion: Completion) {
        self.lock_script().push_back(Ok(completion));
    }

    /// Queue a transport failure
    pub fn push_error(&self, message: impl Into<String>) {
        self.lock_script().push_back(Err(message.into()));
    }

    /// Conversation snapshots, one per call
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn lock_script(&self) -> std::sync::MutexGuard<'_, VecDeque<Result<Completion, String>>> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    async fn complete(
        &self,
        messages: &[Message],
        _tools: &[ToolDefinition],
    ) -> Result<Completion, LlmError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(messages.to_vec());
        let next = self.lock_script().pop_front();
        match next {
            Some(Ok(completion)) => Ok(completion),
            Some(Err(message)) => Err(LlmError::Status {
                status: 500,
                body: message,
            }),
            None => match &self.fallback {
                Some(responder) => responder(messages),
                None => Err(LlmError::EmptyResponse),
            },
        }
    }
}

/// Completion that calls `tool` with JSON `arguments`
pub fn tool_call(id: &str, tool: &str, arguments: &str) -> Completion {
    Completion::with_tool_calls("", vec![ToolCall::new(id, tool, arguments)])
}

/// Observable state of the fake guest
#[derive(Default)]
pub struct FakeGuest {
    commands: Mutex<Vec<String>>,
    pub boots: AtomicUsize,
    pub pauses: AtomicUsize,
    pub resumes: AtomicUsize,
    pub shutdowns: AtomicUsize,
    /// Never answer the readiness probe
    pub silent: AtomicBool,
    /// Fail `boot` outright
    pub fail_boot: AtomicBool,
}

impl FakeGuest {
    /// Commands the guest shell executed, in order, including `cd` prefixes
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record(&self, command: &str) {
        self.commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(command.to_string());
    }
}

/// Backend whose guest is a tiny shell emulator on an in-memory pipe
///
/// Understood commands: `true`, `false`, `echo <text>`, `exit <n>`, `pwd`,
/// `sleep <secs>` (interruptible by ^C), `hang` (ignores ^C), `crash`
/// (closes the console), mount lines, and `cd '<dir>' && <cmd>`. Anything
/// else prints `ran: <cmd>`.
#[derive(Default, Clone)]
pub struct FakeBackend {
    guest: Arc<FakeGuest>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guest(&self) -> Arc<FakeGuest> {
        self.guest.clone()
    }
}

#[async_trait]
impl VmBackend for FakeBackend {
    async fn boot(&self, _config: &VmConfig) -> Result<Box<dyn GuestMachine>, VmError> {
        self.guest.boots.fetch_add(1, Ordering::SeqCst);
        if self.guest.fail_boot.load(Ordering::SeqCst) {
            return Err(VmError::Config("fake boot failure".into()));
        }
        let (host, guest_side) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(host);
        let shell = FakeShell::new(guest_side, self.guest.clone());
        Ok(Box::new(FakeMachine {
            console: Some(Console {
                reader: Box::new(reader),
                writer: Box::new(writer),
            }),
            shell: Some(tokio::spawn(shell.run())),
            guest: self.guest.clone(),
        }))
    }
}

struct FakeMachine {
    console: Option<Console>,
    shell: Option<JoinHandle<()>>,
    guest: Arc<FakeGuest>,
}

#[async_trait]
impl GuestMachine for FakeMachine {
    fn take_console(&mut self) -> Option<Console> {
        self.console.take()
    }

    async fn pause(&mut self) -> Result<(), VmError> {
        self.guest.pauses.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&mut self) -> Result<(), VmError> {
        self.guest.resumes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), VmError> {
        self.guest.shutdowns.fetch_add(1, Ordering::SeqCst);
        if let Some(shell) = self.shell.take() {
            shell.abort();
        }
        Ok(())
    }
}

impl Drop for FakeMachine {
    fn drop(&mut self) {
        if let Some(shell) = self.shell.take() {
            shell.abort();
        }
    }
}

enum Run {
    Exited { output: String, code: i32 },
    Interrupted,
    Crash,
}

struct FakeShell {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    pending: Vec<u8>,
    guest: Arc<FakeGuest>,
    last_exit: i32,
}

impl FakeShell {
    fn new(stream: DuplexStream, guest: Arc<FakeGuest>) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader,
            writer,
            pending: Vec::new(),
            guest,
            last_exit: 0,
        }
    }

    async fn write(&mut self, text: &str) -> bool {
        self.writer.write_all(text.as_bytes()).await.is_ok()
    }

    async fn run(mut self) {
        if !self.write("[    0.000000] Linux version 6.1.0-fake\r\n").await {
            return;
        }
        let mut chunk = [0u8; 4096];
        loop {
            while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = self.pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw)
                    .replace('\x03', "")
                    .trim_end_matches(['\r', '\n'])
                    .to_string();
                if !self.handle_line(&line).await {
                    return;
                }
            }
            match self.reader.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => self.pending.extend_from_slice(&chunk[..n]),
            }
        }
    }

    /// False when the shell should exit
    async fn handle_line(&mut self, line: &str) -> bool {
        if line == "echo ready" {
            if self.guest.silent.load(Ordering::SeqCst) {
                return true;
            }
            return self.write("ready\r\n").await;
        }
        if line.starts_with("export PS1") {
            return true;
        }
        if let Some((command, marker)) = parse_wrapped(line) {
            self.guest.record(&command);
            return match self.execute(&command).await {
                Run::Exited { output, code } => {
                    self.last_exit = code;
                    self.write(&format!("{}{}_{}\r\n", output, marker, code)).await
                }
                Run::Interrupted => {
                    self.last_exit = 130;
                    true
                }
                Run::Crash => false,
            };
        }
        if let Some(text) = line
            .strip_prefix("echo \"")
            .and_then(|rest| rest.strip_suffix('"'))
        {
            let text = text.replace("$?", &self.last_exit.to_string());
            return self.write(&format!("{}\r\n", text)).await;
        }
        true
    }

    async fn execute(&mut self, command: &str) -> Run {
        let (cwd, command) = match command.strip_prefix("cd '") {
            Some(rest) => match rest.split_once("' && ") {
                Some((dir, cmd)) => (dir.to_string(), cmd.to_string()),
                None => ("/".to_string(), command.to_string()),
            },
            None => ("/root".to_string(), command.to_string()),
        };
        let (program, arg) = command
            .split_once(' ')
            .map(|(p, a)| (p, a.trim()))
            .unwrap_or((command.as_str(), ""));

        match program {
            "true" => exited("", 0),
            "false" => exited("", 1),
            "pwd" => exited(&format!("{}\r\n", cwd), 0),
            "echo" => exited(&format!("{}\r\n", arg), 0),
            "exit" => exited("", arg.parse().unwrap_or(1)),
            "mkdir" if command.contains("mount -t 9p") => exited("", 0),
            "sleep" => {
                let secs: u64 = arg.parse().unwrap_or(1);
                if self.sleep(Duration::from_secs(secs), true).await {
                    Run::Interrupted
                } else {
                    exited("", 0)
                }
            }
            "hang" => {
                self.sleep(Duration::from_secs(24 * 3600), false).await;
                exited("", 0)
            }
            "crash" => Run::Crash,
            _ => exited(&format!("ran: {}\r\n", command), 0),
        }
    }

    /// True if ^C arrived before the sleep finished
    async fn sleep(&mut self, duration: Duration, interruptible: bool) -> bool {
        let sleep = tokio::time::sleep(duration);
        tokio::pin!(sleep);
        let mut chunk = [0u8; 1024];
        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                read = self.reader.read(&mut chunk) => {
                    let n = match read {
                        Ok(0) | Err(_) => return true,
                        Ok(n) => n,
                    };
                    let data = &chunk[..n];
                    match data.iter().position(|b| *b == 0x03) {
                        Some(pos) if interruptible => {
                            self.pending.extend_from_slice(&data[pos + 1..]);
                            return true;
                        }
                        _ => self
                            .pending
                            .extend(data.iter().copied().filter(|b| *b != 0x03)),
                    }
                }
            }
        }
    }
}

fn exited(output: &str, code: i32) -> Run {
    Run::Exited {
        output: output.to_string(),
        code,
    }
}

/// Split `(<cmd>); echo "<marker>_$?"` into command and marker
fn parse_wrapped(line: &str) -> Option<(String, String)> {
    let inner = line.strip_prefix('(')?;
    let split = inner.rfind("); echo \"")?;
    let command = &inner[..split];
    let marker = inner[split + "); echo \"".len()..].strip_suffix("_$?\"")?;
    Some((command.to_string(), marker.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wrapped() {
        let (cmd, marker) = parse_wrapped("(echo (hi)); echo \"__AGV_x_$?\"").unwrap();
        assert_eq!(cmd, "echo (hi)");
        assert_eq!(marker, "__AGV_x");
        assert!(parse_wrapped("echo ready").is_none());
    }

    #[tokio::test]
    async fn test_scripted_provider_order_and_fallback() {
        let provider = ScriptedProvider::new(vec![Completion::text("one")]);
        provider.push_error("boom");
        assert_eq!(provider.complete(&[], &[]).await.unwrap().content, "one");
        assert!(matches!(
            provider.complete(&[], &[]).await,
            Err(LlmError::Status { status: 500, .. })
        ));
        assert!(matches!(
            provider.complete(&[], &[]).await,
            Err(LlmError::EmptyResponse)
        ));
        assert_eq!(provider.call_count(), 3);
    }
}
