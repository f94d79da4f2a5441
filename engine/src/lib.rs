pub mod channel;
pub mod lines;
pub mod pool;
pub mod session;
pub mod uci;

pub use channel::{ChannelError, ChannelEvent, EngineChannel, WorkerInbox, WorkerOutbox};
pub use lines::LineReassembler;
pub use pool::{
    AcquirePolicy, EngineLauncher, EngineLease, EnginePool, PoolError, ProcessLauncher,
    WorkerLauncher,
};
pub use session::{
    EvaluationStream, Evaluator, EvaluatorDefaults, SessionError, SessionInput, SessionMachine,
    SessionState,
};
pub use uci::{classify_line, parse_info_line, EngineLine};

use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Search depth used when a request does not name one.
pub const DEFAULT_DEPTH: u32 = 18;

/// Hard deadline for one evaluation when a request does not name one.
pub const DEFAULT_TIME_LIMIT_MS: u64 = 10_000;

/// Number of principal-variation moves kept for display.
pub const PV_DISPLAY_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    White,
    Black,
}

impl Side {
    /// Side to move according to the second field of a FEN string.
    ///
    /// Anything other than an explicit `b` counts as White, so truncated or
    /// hand-written positions still evaluate.
    pub fn to_move(fen: &str) -> Self {
        match fen.split_whitespace().nth(1) {
            Some("b") => Side::Black,
            _ => Side::White,
        }
    }
}

/// Engine score as shown in the evaluation panel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Evaluation {
    /// Centipawn score divided by 100, positive when White is better.
    Pawns(f64),
    /// Signed number of moves until forced mate.
    Mate(i32),
}

impl fmt::Display for Evaluation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Evaluation::Pawns(pawns) => write!(f, "{}", pawns),
            Evaluation::Mate(moves) => write!(f, "M{}", moves),
        }
    }
}

impl Serialize for Evaluation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Evaluation::Pawns(pawns) => serializer.serialize_f64(*pawns),
            Evaluation::Mate(_) => serializer.collect_str(self),
        }
    }
}

/// Whose point of view a `score mate` distance is reported from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatePerspective {
    /// Keep the sign the engine reported (side to move).
    #[default]
    Engine,
    /// Flip the sign when Black is to move, matching centipawn scores.
    White,
}

/// Running analysis state for one evaluation session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub evaluation: Option<Evaluation>,
    pub best_move: String,
    pub principal_variation: Vec<String>,
    pub depth: u32,
    pub nodes: u64,
    pub time: u64,
    fen: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nps: Option<u64>,
    #[serde(skip)]
    side_to_move: Side,
}

impl EvaluationResult {
    pub fn new(fen: impl Into<String>) -> Self {
        let fen = fen.into();
        let side_to_move = Side::to_move(&fen);
        Self {
            evaluation: None,
            best_move: String::new(),
            principal_variation: Vec::new(),
            depth: 0,
            nodes: 0,
            time: 0,
            fen,
            nps: None,
            side_to_move,
        }
    }

    pub fn fen(&self) -> &str {
        &self.fen
    }

    pub fn side_to_move(&self) -> Side {
        self.side_to_move
    }

    /// Derive nodes per second from the reported counters. Leaves `nps`
    /// unset when the engine never reported a positive time.
    pub fn compute_nps(&mut self) {
        if self.time > 0 {
            let seconds = self.time as f64 / 1000.0;
            self.nps = Some((self.nodes as f64 / seconds).round() as u64);
        }
    }
}

/// An evaluation request from the board UI.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationRequest {
    pub fen: String,
    #[serde(default)]
    pub depth: Option<u32>,
    /// Milliseconds.
    #[serde(default)]
    pub time_limit: Option<u64>,
    #[serde(default)]
    pub mate_perspective: MatePerspective,
}

impl EvaluationRequest {
    pub fn new(fen: impl Into<String>) -> Self {
        Self {
            fen: fen.into(),
            depth: None,
            time_limit: None,
            mate_perspective: MatePerspective::default(),
        }
    }

    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn with_time_limit_ms(mut self, time_limit: u64) -> Self {
        self.time_limit = Some(time_limit);
        self
    }

    pub fn with_mate_perspective(mut self, perspective: MatePerspective) -> Self {
        self.mate_perspective = perspective;
        self
    }
}

/// One update delivered to the caller of an evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    /// Intermediate result after the search reached a new depth.
    Info(EvaluationResult),
    /// Final result carrying the best move.
    Done(EvaluationResult),
    /// The session failed; nothing follows.
    Error(SessionError),
}

impl Snapshot {
    pub fn result(&self) -> Option<&EvaluationResult> {
        match self {
            Snapshot::Info(result) | Snapshot::Done(result) => Some(result),
            Snapshot::Error(_) => None,
        }
    }

    /// Encode as one newline-terminated JSON record.
    pub fn to_ndjson(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum TaggedResult<'a> {
    Info(&'a EvaluationResult),
    Done(&'a EvaluationResult),
}

#[derive(Serialize)]
struct ErrorRecord {
    error: String,
}

impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Snapshot::Info(result) => TaggedResult::Info(result).serialize(serializer),
            Snapshot::Done(result) => TaggedResult::Done(result).serialize(serializer),
            Snapshot::Error(error) => ErrorRecord {
                error: error.to_string(),
            }
            .serialize(serializer),
        }
    }
}
