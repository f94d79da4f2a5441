//! Bidirectional line channel to a UCI engine.
//!
//! Two transports sit behind [`EngineChannel`]: a spawned child process
//! talking over stdin/stdout, and an in-process worker task exchanging
//! messages. Callers only see `send`, `recv` and `terminate`.

use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, ChildStdout};
use tokio::sync::{mpsc, oneshot};

const EVENT_BUFFER: usize = 64;
const READ_BUFFER: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to spawn engine process {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Engine has no {0}")]
    MissingPipe(&'static str),
    #[error("Engine channel is closed")]
    Closed,
}

/// Something the engine side of a channel reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Raw output, not necessarily aligned to line boundaries.
    Output(Vec<u8>),
    /// The transport failed while reading or the worker returned an error.
    Error(String),
    /// A queued command could not be written.
    WriteFailed(String),
    /// The engine went away. Carries the exit code when one is known.
    Closed(Option<i32>),
}

/// Handle to a running engine.
///
/// Dropping the handle terminates the engine.
pub struct EngineChannel {
    label: String,
    commands: mpsc::UnboundedSender<String>,
    events: mpsc::Receiver<ChannelEvent>,
    shutdown: Option<oneshot::Sender<()>>,
    exited: Arc<AtomicBool>,
}

impl EngineChannel {
    /// Spawn an engine executable and connect to its stdin/stdout.
    #[tracing::instrument(level = "debug", skip(args))]
    pub fn spawn_process(
        program: &Path,
        args: &[String],
        label: &str,
    ) -> Result<Self, ChannelError> {
        tracing::debug!("Spawning engine process");
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                tracing::error!("Failed to spawn engine: {}", source);
                ChannelError::Spawn {
                    program: program.display().to_string(),
                    source,
                }
            })?;

        let stdin = child.stdin.take().ok_or(ChannelError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ChannelError::MissingPipe("stdout"))?;
        tracing::info!(pid = ?child.id(), "Engine process spawned");

        let (command_tx, command_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(EVENT_BUFFER);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let exited = Arc::new(AtomicBool::new(false));

        tokio::spawn(write_commands(
            stdin,
            command_rx,
            event_tx.clone(),
            label.to_string(),
        ));
        tokio::spawn(supervise_process(
            child,
            stdout,
            shutdown_rx,
            event_tx,
            exited.clone(),
            label.to_string(),
        ));

        Ok(Self {
            label: label.to_string(),
            commands: command_tx,
            events: event_rx,
            shutdown: Some(shutdown_tx),
            exited,
        })
    }

    /// Run an engine as an in-process task.
    ///
    /// The worker receives every command line through its inbox and posts
    /// output text through its outbox. Returning `Ok` closes the channel with
    /// exit code 0; returning `Err` or panicking surfaces as an error event.
    pub fn spawn_worker<F, Fut>(label: &str, worker: F) -> Self
    where
        F: FnOnce(WorkerInbox, WorkerOutbox) -> Fut,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(EVENT_BUFFER);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let exited = Arc::new(AtomicBool::new(false));

        let task = worker(
            WorkerInbox { rx: command_rx },
            WorkerOutbox {
                tx: event_tx.clone(),
            },
        );
        tokio::spawn(supervise_worker(
            task,
            shutdown_rx,
            event_tx,
            exited.clone(),
            label.to_string(),
        ));
        tracing::debug!(label, "Engine worker started");

        Self {
            label: label.to_string(),
            commands: command_tx,
            events: event_rx,
            shutdown: Some(shutdown_tx),
            exited,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Queue one command line. The newline is added by the transport.
    pub fn send(&self, line: impl Into<String>) -> Result<(), ChannelError> {
        if self.shutdown.is_none() {
            return Err(ChannelError::Closed);
        }
        self.commands
            .send(line.into())
            .map_err(|_| ChannelError::Closed)
    }

    /// Wait for the next engine event. `None` once the engine side is gone
    /// and every pending event has been delivered.
    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    /// True once the engine process or worker has finished.
    pub fn has_exited(&self) -> bool {
        self.shutdown.is_none() || self.exited.load(Ordering::Acquire)
    }

    /// Stop the engine. Safe to call any number of times.
    pub fn terminate(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            tracing::debug!(label = %self.label, "Terminating engine channel");
            let _ = shutdown.send(());
        }
    }
}

impl Drop for EngineChannel {
    fn drop(&mut self) {
        self.terminate();
    }
}

impl std::fmt::Debug for EngineChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineChannel")
            .field("label", &self.label)
            .field("exited", &self.has_exited())
            .finish()
    }
}

/// Commands addressed to an in-process worker.
pub struct WorkerInbox {
    rx: mpsc::UnboundedReceiver<String>,
}

impl WorkerInbox {
    /// Next command line, or `None` once the channel was terminated.
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Output side of an in-process worker.
#[derive(Clone)]
pub struct WorkerOutbox {
    tx: mpsc::Sender<ChannelEvent>,
}

impl WorkerOutbox {
    /// Post raw output text. No framing is added, so callers may split lines
    /// across posts. Returns `false` once nobody is listening.
    pub async fn post(&self, text: impl Into<String>) -> bool {
        self.tx
            .send(ChannelEvent::Output(text.into().into_bytes()))
            .await
            .is_ok()
    }

    /// Post one complete line.
    pub async fn post_line(&self, line: &str) -> bool {
        self.post(format!("{}\n", line)).await
    }
}

async fn write_commands<W>(
    mut stdin: W,
    mut command_rx: mpsc::UnboundedReceiver<String>,
    event_tx: mpsc::Sender<ChannelEvent>,
    label: String,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(cmd) = command_rx.recv().await {
        let trimmed = cmd.trim();
        tracing::trace!(label = %label, "UCI >> {}", trimmed);

        let written = async {
            stdin.write_all(trimmed.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = written {
            tracing::error!(label = %label, "Failed to write to engine stdin: {}", e);
            let _ = event_tx.send(ChannelEvent::WriteFailed(e.to_string())).await;
            break;
        }
    }
    tracing::debug!(label = %label, "Stdin writer task exiting");
}

async fn read_output<R>(mut stdout: R, event_tx: mpsc::Sender<ChannelEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!("Engine stdout EOF");
                break;
            }
            Ok(n) => {
                tracing::trace!("UCI << {}", String::from_utf8_lossy(&buf[..n]).trim_end());
                if event_tx
                    .send(ChannelEvent::Output(buf[..n].to_vec()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(e) => {
                tracing::error!("Error reading from engine stdout: {}", e);
                let _ = event_tx.send(ChannelEvent::Error(e.to_string())).await;
                break;
            }
        }
    }
}

async fn supervise_process(
    mut child: Child,
    stdout: ChildStdout,
    mut shutdown_rx: oneshot::Receiver<()>,
    event_tx: mpsc::Sender<ChannelEvent>,
    exited: Arc<AtomicBool>,
    label: String,
) {
    let reader = tokio::spawn(read_output(stdout, event_tx.clone()));

    let status = tokio::select! {
        status = child.wait() => Some(status),
        _ = &mut shutdown_rx => None,
    };
    exited.store(true, Ordering::Release);

    match status {
        Some(status) => {
            // Deliver everything the engine printed before reporting the exit.
            let _ = reader.await;
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::error!(label = %label, "Failed to wait on engine: {}", e);
                    None
                }
            };
            tracing::info!(label = %label, ?code, "Engine process exited");
            let _ = event_tx.send(ChannelEvent::Closed(code)).await;
        }
        None => {
            reader.abort();
            if let Err(e) = child.kill().await {
                tracing::warn!(label = %label, "Failed to kill engine process: {}", e);
            }
            tracing::info!(label = %label, "Engine process terminated");
        }
    }
}

async fn supervise_worker<Fut>(
    task: Fut,
    mut shutdown_rx: oneshot::Receiver<()>,
    event_tx: mpsc::Sender<ChannelEvent>,
    exited: Arc<AtomicBool>,
    label: String,
) where
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    let mut handle = tokio::spawn(task);

    let outcome = tokio::select! {
        joined = &mut handle => Some(joined),
        _ = &mut shutdown_rx => None,
    };
    exited.store(true, Ordering::Release);

    let event = match outcome {
        Some(Ok(Ok(()))) => ChannelEvent::Closed(Some(0)),
        Some(Ok(Err(e))) => {
            tracing::error!(label = %label, "Engine worker failed: {}", e);
            ChannelEvent::Error(e)
        }
        Some(Err(e)) => {
            tracing::error!(label = %label, "Engine worker crashed: {}", e);
            ChannelEvent::Error(format!("worker crashed: {}", e))
        }
        None => {
            handle.abort();
            tracing::debug!(label = %label, "Engine worker terminated");
            return;
        }
    };
    let _ = event_tx.send(event).await;
}
