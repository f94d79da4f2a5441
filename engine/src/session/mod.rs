pub mod machine;

pub use machine::{Release, SessionInput, SessionMachine, SessionState, Transition};

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::Stream;
use tracing::Instrument;
use uuid::Uuid;

use crate::channel::ChannelEvent;
use crate::pool::{EngineLease, EnginePool, PoolError};
use crate::{EvaluationRequest, Snapshot, DEFAULT_DEPTH, DEFAULT_TIME_LIMIT_MS};

const SNAPSHOT_BUFFER: usize = 32;

/// Why an evaluation ended without a best move.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to start engine: {0}")]
    EngineStart(String),
    #[error("Failed to send command to engine: {0}")]
    Communication(String),
    #[error("Engine error: {0}")]
    Runtime(String),
    #[error("Analysis timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("Engine is busy with another evaluation")]
    Busy,
    #[error("Evaluation cancelled")]
    Cancelled,
}

impl From<PoolError> for SessionError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Busy => SessionError::Busy,
            PoolError::Closed => SessionError::EngineStart(e.to_string()),
            PoolError::Launch(e) => SessionError::EngineStart(e.to_string()),
        }
    }
}

impl From<ChannelEvent> for SessionInput {
    fn from(event: ChannelEvent) -> Self {
        match event {
            ChannelEvent::Output(bytes) => SessionInput::Output(bytes),
            ChannelEvent::Error(e) => SessionInput::ChannelError(e),
            ChannelEvent::WriteFailed(e) => SessionInput::WriteFailed(e),
            ChannelEvent::Closed(code) => SessionInput::Closed(code),
        }
    }
}

/// Values applied to requests that leave depth or time limit unset.
#[derive(Debug, Clone, Copy)]
pub struct EvaluatorDefaults {
    pub depth: u32,
    pub time_limit: Duration,
}

impl Default for EvaluatorDefaults {
    fn default() -> Self {
        Self {
            depth: DEFAULT_DEPTH,
            time_limit: Duration::from_millis(DEFAULT_TIME_LIMIT_MS),
        }
    }
}

/// Entry point for evaluations. Cheap to clone.
#[derive(Clone)]
pub struct Evaluator {
    pool: EnginePool,
    defaults: EvaluatorDefaults,
}

impl Evaluator {
    pub fn new(pool: EnginePool) -> Self {
        Self::with_defaults(pool, EvaluatorDefaults::default())
    }

    pub fn with_defaults(pool: EnginePool, defaults: EvaluatorDefaults) -> Self {
        Self { pool, defaults }
    }

    pub fn pool(&self) -> &EnginePool {
        &self.pool
    }

    /// Start an evaluation and return its snapshot stream right away.
    ///
    /// The stream yields `Info` snapshots as the search deepens and ends with
    /// exactly one `Done` or `Error`. Dropping the stream cancels the
    /// evaluation and stops its engine.
    pub fn evaluate(&self, request: EvaluationRequest) -> EvaluationStream {
        let depth = request.depth.unwrap_or(self.defaults.depth);
        let time_limit = request
            .time_limit
            .map(Duration::from_millis)
            .unwrap_or(self.defaults.time_limit);

        let id = Uuid::new_v4();
        let span = tracing::info_span!("evaluation", %id, depth, fen = %request.fen);
        let machine = SessionMachine::new(request.fen, depth, time_limit, request.mate_perspective);

        let (tx, rx) = mpsc::channel(SNAPSHOT_BUFFER);
        tokio::spawn(run_session(machine, self.pool.clone(), tx).instrument(span));

        EvaluationStream { rx }
    }
}

/// Snapshots of one evaluation, in emission order.
pub struct EvaluationStream {
    rx: mpsc::Receiver<Snapshot>,
}

impl EvaluationStream {
    /// Wait for the next snapshot. `None` after the terminal one.
    pub async fn next_snapshot(&mut self) -> Option<Snapshot> {
        self.rx.recv().await
    }

    /// Drain the stream and return the terminal snapshot.
    pub async fn finish(mut self) -> Option<Snapshot> {
        let mut last = None;
        while let Some(snapshot) = self.rx.recv().await {
            last = Some(snapshot);
        }
        last
    }
}

impl Stream for EvaluationStream {
    type Item = Snapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Snapshot>> {
        self.rx.poll_recv(cx)
    }
}

async fn run_session(
    mut machine: SessionMachine,
    pool: EnginePool,
    tx: mpsc::Sender<Snapshot>,
) {
    machine.begin();
    tracing::info!("Evaluation starting");

    let acquired = tokio::select! {
        acquired = pool.acquire() => acquired,
        _ = tx.closed() => {
            tracing::debug!("Evaluation cancelled while waiting for an engine");
            machine.start_failed(SessionError::Cancelled);
            return;
        }
    };

    let mut lease = match acquired {
        Ok(lease) => lease,
        Err(e) => {
            let transition = machine.start_failed(e.into());
            deliver(&tx, transition.snapshots).await;
            return;
        }
    };

    let deadline = Instant::now() + machine.time_limit();

    for command in machine.commands() {
        if let Err(e) = lease.channel().send(command) {
            let transition = machine.step(SessionInput::WriteFailed(e.to_string()));
            finish(lease, &tx, transition).await;
            return;
        }
    }
    machine.commands_sent();
    tracing::debug!(label = lease.channel().label(), "Analysis commands sent");

    loop {
        let input = tokio::select! {
            biased;

            event = lease.channel_mut().recv() => match event {
                Some(event) => SessionInput::from(event),
                None => SessionInput::Closed(None),
            },
            _ = tokio::time::sleep_until(deadline) => SessionInput::Deadline,
            _ = tx.closed() => SessionInput::Cancelled,
        };

        let transition = machine.step(input);
        if transition.release.is_some() {
            finish(lease, &tx, transition).await;
            return;
        }
        deliver(&tx, transition.snapshots).await;
    }
}

async fn finish(lease: EngineLease, tx: &mpsc::Sender<Snapshot>, transition: Transition) {
    match transition.release {
        Some(Release::Return) => lease.release().await,
        _ => lease.terminate(),
    }
    deliver(tx, transition.snapshots).await;
}

async fn deliver(tx: &mpsc::Sender<Snapshot>, snapshots: Vec<Snapshot>) {
    for snapshot in snapshots {
        if tx.send(snapshot).await.is_err() {
            tracing::debug!("Snapshot receiver dropped");
            return;
        }
    }
}
