#[cfg(unix)]
use std::os::unix::process::ExitStatusExt;

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::config::OrchestratorConfig;
use crate::process_death::configure_child;

use super::lifecycle::LifecycleController;
use super::output::OutputStream;
use super::output::Utf8Carry;
use super::process_id::ProcessId;
use super::record::ProcessMode;
use super::slot::SlotGrant;

const READ_CHUNK_SIZE: usize = 8192;
#[cfg(unix)]
const EXIT_CODE_SIGNAL_BASE: i32 = 128; // conventional shell: 128 + signal

/// Everything the spawner needs to launch one command.
#[derive(Debug, Clone)]
pub(crate) struct SpawnRequest {
    pub(crate) id: ProcessId,
    pub(crate) command: String,
    pub(crate) mode: ProcessMode,
    pub(crate) cwd: PathBuf,
    /// Only honoured for active requests.
    pub(crate) timeout: Option<Duration>,
}

/// Handle on a live child. The child itself is owned by its supervisor task;
/// this side can only ask it to terminate.
#[derive(Debug)]
pub(crate) struct OsHandle {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<Duration>>,
}

impl OsHandle {
    pub(crate) fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Sends the graceful termination signal right away and leaves the
    /// supervisor to force-kill the child if it is still alive after `grace`.
    pub(crate) fn terminate(mut self, grace: Duration) {
        #[cfg(unix)]
        if let Some(pid) = self.pid
            && let Err(err) = crate::process_death::signal_process_group(pid, libc::SIGTERM)
        {
            warn!(pid, "failed to send SIGTERM: {err}");
        }
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(grace);
        }
    }
}

#[derive(Clone)]
pub(crate) struct ProcessSpawner {
    controller: Arc<LifecycleController>,
    shell: PathBuf,
    drain_timeout: Duration,
}

impl ProcessSpawner {
    pub(crate) fn new(controller: Arc<LifecycleController>, config: &OrchestratorConfig) -> Self {
        Self {
            controller,
            shell: config.shell.clone(),
            drain_timeout: config.output_drain_timeout(),
        }
    }

    /// Launches the command and returns as soon as the OS spawn attempt is
    /// done. A launch failure is recorded as a failed process rather than
    /// returned, and `grant` (if any) is handed back to the allocator.
    pub(crate) async fn spawn(&self, request: SpawnRequest, grant: Option<SlotGrant>) -> ProcessId {
        let id = request.id;
        let mut child = match self.build_command(&request).spawn() {
            Ok(child) => child,
            Err(err) => {
                warn!(process_id = %id, command = %request.command, "failed to spawn process: {err}");
                self.controller.record_spawn_failure(&request, &err).await;
                drop(grant);
                return id;
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (kill_tx, kill_rx) = oneshot::channel();
        let handle = OsHandle {
            pid: child.id(),
            kill_tx: Some(kill_tx),
        };

        self.controller.register_running(&request, handle).await;
        if let Some(grant) = grant {
            grant.commit();
        }

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = stdout {
            readers.push(tokio::spawn(pump_output(
                Arc::clone(&self.controller),
                id,
                OutputStream::Stdout,
                stdout,
            )));
        }
        if let Some(stderr) = stderr {
            readers.push(tokio::spawn(pump_output(
                Arc::clone(&self.controller),
                id,
                OutputStream::Stderr,
                stderr,
            )));
        }

        tokio::spawn(supervise(
            Arc::clone(&self.controller),
            id,
            child,
            kill_rx,
            readers,
            self.drain_timeout,
        ));
        id
    }

    fn build_command(&self, request: &SpawnRequest) -> Command {
        let mut command = Command::new(&self.shell);
        #[cfg(unix)]
        command.arg("-c");
        #[cfg(windows)]
        command.arg("/C");
        command
            .arg(&request.command)
            .current_dir(&request.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        configure_child(&mut command);
        command
    }
}

async fn pump_output<R: AsyncRead + Unpin>(
    controller: Arc<LifecycleController>,
    id: ProcessId,
    stream: OutputStream,
    mut reader: R,
) {
    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    let mut carry = Utf8Carry::default();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = carry.decode(&buf[..n]);
                if !text.is_empty() {
                    controller.append_output(id, stream, text).await;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                warn!(process_id = %id, stream = stream.label(), "failed to read output: {err}");
                break;
            }
        }
    }
    let tail = carry.finish();
    if !tail.is_empty() {
        controller.append_output(id, stream, tail).await;
    }
}

/// Owns the child until it is reaped, then reports the exit once both output
/// pumps have drained (or `drain_timeout` passes).
async fn supervise(
    controller: Arc<LifecycleController>,
    id: ProcessId,
    mut child: Child,
    mut kill_rx: oneshot::Receiver<Duration>,
    readers: Vec<JoinHandle<()>>,
    drain_timeout: Duration,
) {
    let pid = child.id();
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(grace) = &mut kill_rx => escalate(&mut child, pid, grace).await,
    };

    let aborts = readers
        .iter()
        .map(JoinHandle::abort_handle)
        .collect::<Vec<_>>();
    if tokio::time::timeout(drain_timeout, futures::future::join_all(readers))
        .await
        .is_err()
    {
        debug!(process_id = %id, "output pipes still open after exit; detaching readers");
        for abort in aborts {
            abort.abort();
        }
    }

    controller.on_exit(id, status).await;
}

async fn escalate(child: &mut Child, pid: Option<u32>, grace: Duration) -> io::Result<ExitStatus> {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            warn!(
                pid,
                grace_ms = grace.as_millis() as u64,
                "process ignored graceful termination; forcing kill"
            );
            #[cfg(unix)]
            if let Some(pid) = pid
                && let Err(err) = crate::process_death::signal_process_group(pid, libc::SIGKILL)
            {
                warn!(pid, "failed to send SIGKILL: {err}");
            }
            if let Err(err) = child.start_kill() {
                debug!(pid, "start_kill after SIGKILL: {err}");
            }
            child.wait().await
        }
    }
}

/// Exit code as a shell would report it: signal deaths map to 128 + signal.
pub(crate) fn exit_code_of(status: &ExitStatus) -> i32 {
    status.code().unwrap_or_else(|| {
        #[cfg(unix)]
        {
            if let Some(signal) = status.signal() {
                return EXIT_CODE_SIGNAL_BASE + signal;
            }
        }
        -1
    })
}
