//! Headless engine subprocess over stdin/stdout pipes.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{spawn_reader, Inbox, StreamTransport, Transport, TransportKind};
use crate::config::ProcessConfig;
use crate::error::{BridgeError, CloseReason, Result};

/// How long `close()` waits for the killed process to be reaped.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// How long after exit the engine's stdout may stay open (held by a
/// grandchild, say) before the exit is recorded anyway.
const EOF_GRACE: Duration = Duration::from_millis(500);

/// Engine child process speaking the line protocol on its stdio.
///
/// # Process Cleanup Safety
///
/// A monitor task owns the `Child` and records its exit status in the inbox,
/// so a pending read fails with the exit code once the engine has died and
/// everything it wrote has been read.
/// `close()` asks the monitor to kill the process; if the transport is
/// dropped instead, the monitor sees its kill channel close and kills the
/// process anyway, and `kill_on_drop` covers a runtime shutting down
/// underneath it.
pub struct ProcessTransport {
    stream: StreamTransport,
    kill_tx: Option<oneshot::Sender<()>>,
    monitor: Option<JoinHandle<()>>,
    pid: Option<u32>,
}

impl ProcessTransport {
    /// Spawn the engine and start reading its stdout.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::Spawn` if the program cannot be started or its
    /// pipes cannot be captured.
    pub fn spawn(config: &ProcessConfig) -> Result<Self> {
        info!(
            "Starting engine process: {} {}",
            config.program,
            config.args.join(" ")
        );

        let mut cmd = Command::new(&config.program);
        cmd.args(&config.args)
            .envs(config.command_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            cmd.current_dir(cwd);
        }

        let spawn_error = |source: std::io::Error| BridgeError::Spawn {
            program: config.program.clone(),
            source,
        };

        let mut child = cmd.spawn().map_err(spawn_error)?;
        let pid = child.id();

        let stdin = child.stdin.take().ok_or_else(|| {
            spawn_error(std::io::Error::other("stdin handle was not captured"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            spawn_error(std::io::Error::other("stdout handle was not captured"))
        })?;

        let inbox = Inbox::new();
        let reader_task = spawn_reader(stdout, inbox.clone(), false);
        let (kill_tx, kill_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor_child(child, kill_rx, inbox.clone()));

        debug!(?pid, "engine process spawned");

        Ok(Self {
            stream: StreamTransport::from_parts(TransportKind::Process, stdin, inbox, reader_task),
            kill_tx: Some(kill_tx),
            monitor: Some(monitor),
            pid,
        })
    }

    /// OS process id, if the process had not already exited at spawn time.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

/// Wait for the child to exit, or kill it when asked (or when the
/// transport is dropped), then record why the pipe went quiet.
///
/// On a natural exit the close is recorded only after stdout is drained, so
/// a response written just before exiting still reaches the caller.
async fn monitor_child(mut child: Child, kill_rx: oneshot::Receiver<()>, inbox: Inbox) {
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill_rx => None,
    };

    let status = match exited {
        Some(status) => {
            inbox.wait_for_eof(EOF_GRACE).await;
            status
        }
        None => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill engine process: {}", e);
            }
            child.wait().await
        }
    };

    match status {
        Ok(status) => {
            debug!(%status, "engine process exited");
            inbox.close(exit_reason(status));
        }
        Err(e) => inbox.close(CloseReason::ReadFailed(format!(
            "failed to wait for engine process: {}",
            e
        ))),
    }
}

fn exit_reason(status: ExitStatus) -> CloseReason {
    #[cfg(unix)]
    let signal = std::os::unix::process::ExitStatusExt::signal(&status);
    #[cfg(not(unix))]
    let signal = None;

    CloseReason::Exited {
        code: status.code(),
        signal,
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Process
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stream.send_line(line).await
    }

    async fn recv_line(&mut self, deadline: Instant) -> Result<Option<String>> {
        self.stream.recv_line(deadline).await
    }

    fn drain_lines(&mut self) -> Vec<String> {
        self.stream.drain_lines()
    }

    fn close_reason(&self) -> Option<CloseReason> {
        self.stream.close_reason()
    }

    async fn close(&mut self) {
        // Closes stdin first; a well-behaved engine exits on EOF.
        self.stream.close().await;

        if let Some(kill_tx) = self.kill_tx.take() {
            // The monitor is gone if the process already exited.
            let _ = kill_tx.send(());
        }
        if let Some(monitor) = self.monitor.take() {
            if tokio::time::timeout(KILL_GRACE, monitor).await.is_err() {
                warn!(pid = ?self.pid, "Engine process did not exit after kill");
            }
        }
    }
}
