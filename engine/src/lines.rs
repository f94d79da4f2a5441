//! Reassembly of engine output chunks into protocol lines.

/// Splits a chunked byte stream into newline-terminated lines.
///
/// Output arrives from the engine in arbitrary pieces. Anything after the
/// last newline of a chunk is held back and prefixed to the next chunk.
/// Leftover bytes are simply dropped with the reassembler; no synthetic line
/// is produced for them.
#[derive(Debug, Default)]
pub struct LineReassembler {
    pending: Vec<u8>,
}

impl LineReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and iterate over every line it completes.
    ///
    /// Lines are produced lazily; bytes of lines not yet pulled from the
    /// iterator stay buffered and will be yielded by the next call.
    pub fn push(&mut self, chunk: impl AsRef<[u8]>) -> Lines<'_> {
        self.pending.extend_from_slice(chunk.as_ref());
        Lines { reassembler: self }
    }

    /// Bytes buffered after the last complete line.
    pub fn partial_len(&self) -> usize {
        self.pending.len()
    }

    fn next_line(&mut self) -> Option<String> {
        let newline = self.pending.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=newline).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(match String::from_utf8(line) {
            Ok(line) => line,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        })
    }
}

/// Iterator over the complete lines currently buffered.
pub struct Lines<'a> {
    reassembler: &'a mut LineReassembler,
}

impl Iterator for Lines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        self.reassembler.next_line()
    }
}
