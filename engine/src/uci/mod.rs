pub mod parser;

pub use parser::{classify_line, parse_info_line, EngineLine};

/// Commands that start an analysis, in the order the engine expects them.
///
/// Line breaks inside the FEN become spaces so it stays a single command.
pub fn analysis_commands(fen: &str, depth: u32) -> [String; 4] {
    let fen: String = fen
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();
    [
        "uci".to_string(),
        "isready".to_string(),
        format!("position fen {}", fen.trim()),
        format!("go depth {}", depth),
    ]
}
