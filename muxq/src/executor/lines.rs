//! Line splitting for tool output.
//!
//! Progress bars are redrawn with bare `\r`, so both `\r` and `\n` end a line.

use std::collections::VecDeque;

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tracing::{debug, warn};

/// Longest line we are willing to buffer.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    Stdout,
    Stderr,
}

/// One line of tool output.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub source: OutputSource,
    pub text: String,
}

/// Forward every non-empty line of `reader` into `tx` until EOF.
///
/// Lines longer than the buffer limit are dropped and reading continues, so
/// the tool never sees its pipe close early.
pub fn spawn_line_reader<R>(reader: R, source: OutputSource, tx: mpsc::UnboundedSender<OutputLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let codec =
            AnyDelimiterCodec::new_with_max_length(b"\r\n".to_vec(), b"\n".to_vec(), MAX_LINE_BYTES);
        let mut frames = FramedRead::new(reader, codec);
        // FramedRead yields one `None` after a decode error before it resumes.
        let mut resuming = false;

        loop {
            match frames.next().await {
                Some(Ok(chunk)) => {
                    resuming = false;
                    let text = String::from_utf8_lossy(&chunk).trim().to_string();
                    if text.is_empty() {
                        continue;
                    }
                    if tx.send(OutputLine { source, text }).is_err() {
                        break;
                    }
                }
                Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                    warn!(?source, limit = MAX_LINE_BYTES, "Skipping oversized output line");
                    resuming = true;
                }
                Some(Err(e)) => {
                    warn!(?source, error = %e, "Stopped reading tool output");
                    break;
                }
                None if resuming => resuming = false,
                None => break,
            }
        }
        debug!(?source, "Tool output closed");
    });
}

/// Keeps the last `capacity` lines for error reports.
#[derive(Debug)]
pub struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(256)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        while self.lines.len() >= self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn join(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reader_splits_on_carriage_returns() {
        let input: &[u8] = b"Importing: |=   | (10/100)\rImporting: |==  | (50/100)\r\nDone\n\n";
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_line_reader(input, OutputSource::Stderr, tx);

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            assert_eq!(line.source, OutputSource::Stderr);
            lines.push(line.text);
        }
        assert_eq!(
            lines,
            vec![
                "Importing: |=   | (10/100)",
                "Importing: |==  | (50/100)",
                "Done"
            ]
        );
    }

    #[tokio::test]
    async fn test_reader_skips_oversized_line_and_keeps_going() {
        let mut input = vec![b'x'; MAX_LINE_BYTES * 2];
        input.extend_from_slice(b"\nafter\rError: last words\n");
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_line_reader(std::io::Cursor::new(input), OutputSource::Stderr, tx);

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line.text);
        }
        assert_eq!(lines, vec!["after", "Error: last words"]);
    }

    #[test]
    fn test_tail_keeps_last_lines() {
        let mut tail = OutputTail::new(2);
        assert!(tail.is_empty());
        tail.push("one");
        tail.push("two");
        tail.push("three");
        assert_eq!(tail.join(), "two\nthree");
    }
}
