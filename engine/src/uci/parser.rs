use crate::{Evaluation, EvaluationResult, MatePerspective, Side, PV_DISPLAY_LEN};
use std::str::FromStr;

/// Engine output line, dispatched by prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineLine<'a> {
    /// `info` line carrying a search depth
    Info,
    /// `bestmove` line with the move token (empty if the engine sent none)
    BestMove(&'a str),
    /// Anything else: `id`, `uciok`, `readyok`, `info string`, secondary
    /// multipv lines, noise
    Other,
}

/// Decide how a line from the engine should be handled.
pub fn classify_line(line: &str) -> EngineLine<'_> {
    let mut tokens = line.split_whitespace();

    match tokens.next() {
        Some("info") => {
            let fields: Vec<&str> = tokens.take_while(|t| *t != "string").collect();
            if !fields.contains(&"depth") || is_secondary_line(&fields) {
                EngineLine::Other
            } else {
                EngineLine::Info
            }
        }
        Some("bestmove") => EngineLine::BestMove(tokens.next().unwrap_or("")),
        _ => EngineLine::Other,
    }
}

fn is_secondary_line(fields: &[&str]) -> bool {
    fields
        .windows(2)
        .any(|w| w[0] == "multipv" && w[1].parse::<u32>().is_ok_and(|k| k > 1))
}

/// Fold one `info` line into the running result.
///
/// Only the fields present on the line are touched. Values that do not parse
/// are skipped and the previous value stays. Centipawn scores are stored from
/// White's point of view; mate distances follow `mate`.
pub fn parse_info_line(line: &str, into: &mut EvaluationResult, mate: MatePerspective) {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.first() != Some(&"info") {
        return;
    }

    let flip = into.side_to_move() == Side::Black;
    let mut i = 1;

    while i < tokens.len() {
        match tokens[i] {
            "depth" => {
                if let Some(depth) = value_at::<u32>(&tokens, i + 1) {
                    into.depth = into.depth.max(depth);
                    i += 1;
                }
            }
            "nodes" => {
                if let Some(nodes) = value_at(&tokens, i + 1) {
                    into.nodes = nodes;
                    i += 1;
                }
            }
            "time" => {
                if let Some(time) = value_at(&tokens, i + 1) {
                    into.time = time;
                    i += 1;
                }
            }
            "score" => match tokens.get(i + 1) {
                Some(&"cp") => {
                    let cp = value_at::<i64>(&tokens, i + 2)
                        .and_then(|cp| if flip { cp.checked_neg() } else { Some(cp) });
                    if let Some(cp) = cp {
                        into.evaluation = Some(Evaluation::Pawns(cp as f64 / 100.0));
                        i += 2;
                    }
                }
                Some(&"mate") => {
                    let moves = value_at::<i32>(&tokens, i + 2).and_then(|moves| match mate {
                        MatePerspective::White if flip => moves.checked_neg(),
                        _ => Some(moves),
                    });
                    if let Some(moves) = moves {
                        into.evaluation = Some(Evaluation::Mate(moves));
                        i += 2;
                    }
                }
                _ => {}
            },
            "pv" => {
                into.principal_variation = tokens[i + 1..]
                    .iter()
                    .take(PV_DISPLAY_LEN)
                    .map(|mv| mv.to_string())
                    .collect();
                break;
            }
            "string" => break,
            _ => {
                // Unknown keyword, skip
            }
        }
        i += 1;
    }
}

fn value_at<T: FromStr>(tokens: &[&str], i: usize) -> Option<T> {
    tokens.get(i).and_then(|s| s.parse().ok())
}
