//! Reassembles complete lines from the worker's fragmented pipe reads.

use std::fmt;
use tracing::warn;

/// Longest line kept in memory; longer runs are cut into pieces of this size.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Stdout,
    Stderr,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Stdout => "stdout",
            Channel::Stderr => "stderr",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-channel residual buffer.
///
/// `\n`, `\r\n` and a lone `\r` all end a line. A `\r\n` pair split across two
/// chunks still counts as a single terminator, so the emitted sequence does not
/// depend on where the reads were cut.
#[derive(Debug)]
pub struct LineBuffer {
    residual: Vec<u8>,
    after_cr: bool,
    max_line: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            residual: Vec::new(),
            after_cr: false,
            max_line: max_line.max(1),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if self.after_cr {
                self.after_cr = false;
                if byte == b'\n' {
                    continue;
                }
            }
            match byte {
                b'\n' => lines.push(self.take_line()),
                b'\r' => {
                    lines.push(self.take_line());
                    self.after_cr = true;
                }
                other => {
                    self.residual.push(other);
                    if self.residual.len() >= self.max_line {
                        warn!(limit = self.max_line, "unterminated worker line hit the size cap; flushing it");
                        lines.push(self.take_line());
                    }
                }
            }
        }
        lines
    }

    /// Flushes an unterminated trailing fragment when the channel closes.
    pub fn finish(&mut self) -> Option<String> {
        self.after_cr = false;
        if self.residual.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    pub fn pending_len(&self) -> usize {
        self.residual.len()
    }

    fn take_line(&mut self) -> String {
        let bytes = std::mem::take(&mut self.residual);
        match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }
    }
}
