use std::time::Duration;

use crate::lines::LineReassembler;
use crate::uci::{analysis_commands, classify_line, parse_info_line, EngineLine};
use crate::{EvaluationResult, MatePerspective, Snapshot};

use super::SessionError;

/// Lifecycle of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Done,
    Failed,
    TimedOut,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Done | SessionState::Failed | SessionState::TimedOut
        )
    }
}

/// Everything that can happen to a session once it is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionInput {
    Output(Vec<u8>),
    ChannelError(String),
    WriteFailed(String),
    Closed(Option<i32>),
    Deadline,
    Cancelled,
}

/// What the owner of the channel should do with it after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Search finished cleanly; the engine can serve another session.
    Return,
    /// The engine is in an unknown state and must be stopped.
    Terminate,
}

/// Result of feeding one input to the machine.
#[derive(Debug, Default, PartialEq)]
pub struct Transition {
    pub snapshots: Vec<Snapshot>,
    pub release: Option<Release>,
}

/// State of one evaluation, advanced by [`SessionMachine::step`].
///
/// The machine performs no I/O. It owns the running result and the line
/// buffer, and decides which snapshots to emit and when the channel is done.
#[derive(Debug)]
pub struct SessionMachine {
    state: SessionState,
    result: EvaluationResult,
    lines: LineReassembler,
    depth: u32,
    time_limit: Duration,
    mate: MatePerspective,
    last_emitted_depth: u32,
}

impl SessionMachine {
    pub fn new(
        fen: impl Into<String>,
        depth: u32,
        time_limit: Duration,
        mate: MatePerspective,
    ) -> Self {
        Self {
            state: SessionState::Idle,
            result: EvaluationResult::new(fen),
            lines: LineReassembler::new(),
            depth,
            time_limit,
            mate,
            last_emitted_depth: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn result(&self) -> &EvaluationResult {
        &self.result
    }

    pub fn time_limit(&self) -> Duration {
        self.time_limit
    }

    /// Idle → Starting. Returns `false` if the session already began.
    pub fn begin(&mut self) -> bool {
        if self.state != SessionState::Idle {
            return false;
        }
        self.state = SessionState::Starting;
        true
    }

    /// Starting → Failed, when no channel could be obtained.
    pub fn start_failed(&mut self, error: SessionError) -> Transition {
        if self.state.is_terminal() {
            return Transition::default();
        }
        self.fail(SessionState::Failed, error, None)
    }

    /// Commands to write once a channel is held.
    pub fn commands(&self) -> [String; 4] {
        analysis_commands(self.result.fen(), self.depth)
    }

    /// Starting → Running, after every command was queued.
    pub fn commands_sent(&mut self) {
        if self.state == SessionState::Starting {
            self.state = SessionState::Running;
        }
    }

    /// Advance the machine. Inputs arriving after a terminal state are
    /// ignored, which covers a deadline racing a `bestmove`.
    pub fn step(&mut self, input: SessionInput) -> Transition {
        if self.state.is_terminal() {
            tracing::trace!(state = ?self.state, ?input, "Ignoring input after session end");
            return Transition::default();
        }

        match input {
            SessionInput::Output(chunk) => self.on_output(&chunk),
            SessionInput::ChannelError(e) => self.fail(
                SessionState::Failed,
                SessionError::Runtime(e),
                Some(Release::Terminate),
            ),
            SessionInput::WriteFailed(e) => self.fail(
                SessionState::Failed,
                SessionError::Communication(e),
                Some(Release::Terminate),
            ),
            SessionInput::Closed(code) => {
                let reason = match code {
                    Some(code) => format!("engine exited with code {} before bestmove", code),
                    None => "engine exited before bestmove".to_string(),
                };
                self.fail(
                    SessionState::Failed,
                    SessionError::Runtime(reason),
                    Some(Release::Terminate),
                )
            }
            SessionInput::Deadline => self.fail(
                SessionState::TimedOut,
                SessionError::Timeout(self.time_limit),
                Some(Release::Terminate),
            ),
            SessionInput::Cancelled => {
                tracing::debug!("Evaluation cancelled by consumer");
                self.fail(
                    SessionState::Failed,
                    SessionError::Cancelled,
                    Some(Release::Terminate),
                )
            }
        }
    }

    fn on_output(&mut self, chunk: &[u8]) -> Transition {
        let mut transition = Transition::default();

        for line in self.lines.push(chunk) {
            match classify_line(&line) {
                EngineLine::Info => {
                    parse_info_line(&line, &mut self.result, self.mate);
                    if self.result.depth > self.last_emitted_depth {
                        self.last_emitted_depth = self.result.depth;
                        tracing::debug!(depth = self.result.depth, "New search depth");
                        transition
                            .snapshots
                            .push(Snapshot::Info(self.result.clone()));
                    }
                }
                EngineLine::BestMove(mv) => {
                    self.result.best_move = mv.to_string();
                    self.result.compute_nps();
                    self.state = SessionState::Done;
                    tracing::info!(
                        best_move = %self.result.best_move,
                        depth = self.result.depth,
                        nps = ?self.result.nps,
                        "Evaluation complete"
                    );
                    transition
                        .snapshots
                        .push(Snapshot::Done(self.result.clone()));
                    transition.release = Some(Release::Return);
                    break;
                }
                EngineLine::Other => {}
            }
        }

        transition
    }

    fn fail(
        &mut self,
        state: SessionState,
        error: SessionError,
        release: Option<Release>,
    ) -> Transition {
        tracing::warn!(from = ?self.state, to = ?state, "Evaluation failed: {}", error);
        self.state = state;
        Transition {
            snapshots: vec![Snapshot::Error(error)],
            release,
        }
    }
}
