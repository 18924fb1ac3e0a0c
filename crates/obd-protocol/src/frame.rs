//! Response Line Framing
//!
//! The adapter answers with CR-terminated ASCII lines, optionally with
//! linefeeds, spaces between hex bytes and a trailing `>` prompt. Lines may be
//! split or coalesced arbitrarily by the serial link, so bytes are accumulated
//! here and only complete lines are handed on.

use tracing::warn;

/// Line terminator used by the adapter
pub const TERMINATOR: u8 = 0x0D;

/// Prompt character the adapter prints when it is ready for a command
pub const PROMPT: u8 = b'>';

/// Longest line kept; anything longer is dropped whole
pub const MAX_BUFFERED_BYTES: usize = 4096;

/// Accumulates raw bytes and extracts cleaned response lines
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
    /// Skipping the rest of an overlong line
    discarding: bool,
}

impl FrameBuffer {
    /// Create an empty frame buffer
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(256),
            discarding: false,
        }
    }

    /// Append bytes and return every line completed by them.
    ///
    /// Lines that are empty after noise removal are dropped, as are lines
    /// longer than [`MAX_BUFFERED_BYTES`], however the bytes were chunked.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut bytes = bytes;
        if self.discarding {
            match bytes.iter().position(|b| *b == TERMINATOR) {
                Some(end) => {
                    self.discarding = false;
                    bytes = &bytes[end + 1..];
                }
                None => return Vec::new(),
            }
        }
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(end) = self.buffer.iter().position(|b| *b == TERMINATOR) {
            if end > MAX_BUFFERED_BYTES {
                warn!("Dropping {} byte line from frame buffer", end);
            } else {
                let line = clean_line(&self.buffer[..end]);
                if !line.is_empty() {
                    lines.push(line);
                }
            }
            self.buffer.drain(..=end);
        }

        if self.buffer.len() > MAX_BUFFERED_BYTES {
            warn!(
                "Discarding {} unterminated bytes from frame buffer",
                self.buffer.len()
            );
            self.buffer.clear();
            self.discarding = true;
        }

        lines
    }

    /// Number of bytes waiting for a terminator
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial line
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }
}

/// Strip CR, LF, spaces and prompts from a raw line
fn clean_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let stripped: String = text
        .chars()
        .filter(|c| !matches!(c, '\r' | '\n' | ' ' | '>'))
        .collect();
    stripped.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_single_reply() {
        let mut frames = FrameBuffer::new();
        let lines = frames.push(b"41 0C 1A F8 \r\r>");
        assert_eq!(lines, vec!["410C1AF8"]);
        // The prompt stays buffered until the next terminator
        assert_eq!(frames.pending(), 1);
    }

    #[test]
    fn test_prompt_is_stripped_from_next_line() {
        let mut frames = FrameBuffer::new();
        frames.push(b"OK\r\r>");
        let lines = frames.push(b"41 0D 40\r");
        assert_eq!(lines, vec!["410D40"]);
    }

    #[test]
    fn test_fragmented_line() {
        let mut frames = FrameBuffer::new();
        assert!(frames.push(b"41 0").is_empty());
        assert!(frames.push(b"D ").is_empty());
        assert_eq!(frames.push(b"40\r"), vec!["410D40"]);
        assert_eq!(frames.pending(), 0);
    }

    #[test]
    fn test_coalesced_lines() {
        let mut frames = FrameBuffer::new();
        let lines = frames.push(b"SEARCHING...\r\n41 0C 1A F8\r\n\r\n>");
        assert_eq!(lines, vec!["SEARCHING...", "410C1AF8"]);
    }

    #[test]
    fn test_clear_discards_partial_line() {
        let mut frames = FrameBuffer::new();
        frames.push(b"41 0C 1A");
        frames.clear();
        assert_eq!(frames.push(b"41 0D 40\r"), vec!["410D40"]);
    }

    #[test]
    fn test_runaway_buffer_is_discarded() {
        let mut frames = FrameBuffer::new();
        let noise = vec![b'A'; MAX_BUFFERED_BYTES + 1];
        assert!(frames.push(&noise).is_empty());
        assert_eq!(frames.pending(), 0);
    }

    #[test]
    fn test_overlong_line_dropped_however_chunked() {
        let mut data = vec![b'A'; MAX_BUFFERED_BYTES + 104];
        data.extend_from_slice(b"\r41 0D 40\r");

        let whole = FrameBuffer::new().push(&data);

        let mut frames = FrameBuffer::new();
        let mut split = frames.push(&data[..MAX_BUFFERED_BYTES + 54]);
        split.extend(frames.push(&data[MAX_BUFFERED_BYTES + 54..]));

        assert_eq!(whole, vec!["410D40"]);
        assert_eq!(split, whole);
    }

    #[test]
    fn test_line_at_limit_is_kept() {
        let mut frames = FrameBuffer::new();
        let mut data = vec![b'4'; MAX_BUFFERED_BYTES];
        frames.push(&data[..100]);
        data.push(TERMINATOR);
        let lines = frames.push(&data[100..]);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), MAX_BUFFERED_BYTES);
    }

    fn wire_byte() -> impl Strategy<Value = u8> {
        prop_oneof![
            Just(TERMINATOR),
            Just(PROMPT),
            Just(b' '),
            Just(b'\n'),
            b'0'..=b'9',
            b'A'..=b'F',
        ]
    }

    proptest! {
        #[test]
        fn test_chunk_boundaries_do_not_change_lines(
            data in proptest::collection::vec(wire_byte(), 0..256),
            runaway in proptest::option::of(MAX_BUFFERED_BYTES - 8..MAX_BUFFERED_BYTES + 64),
            cuts in proptest::collection::vec(0usize..4608, 0..12),
        ) {
            let mut data = data;
            if let Some(len) = runaway {
                let tail = data.split_off(data.len() / 2);
                data.extend(std::iter::repeat(b'B').take(len));
                data.extend(tail);
            }
            let expected = FrameBuffer::new().push(&data);

            let mut cuts: Vec<usize> = cuts.into_iter().map(|c| c.min(data.len())).collect();
            cuts.sort_unstable();

            let mut frames = FrameBuffer::new();
            let mut lines = Vec::new();
            let mut start = 0;
            for cut in cuts.into_iter().chain(std::iter::once(data.len())) {
                lines.extend(frames.push(&data[start..cut]));
                start = cut;
            }

            prop_assert_eq!(lines, expected);
        }
    }
}
