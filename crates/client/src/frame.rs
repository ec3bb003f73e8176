//! Incremental decoder for `text/event-stream` bodies.
//!
//! Network chunks may split a frame (or a multi-byte UTF-8 character)
//! anywhere, so raw bytes are buffered and only complete lines are
//! decoded. A frame is dispatched on the blank line that terminates it.
//! Each byte is searched for a newline once, and a single line may not
//! grow past [`DEFAULT_MAX_LINE_BYTES`] (or the limit given to
//! [`FrameDecoder::with_max_line`]).

/// One dispatched event-stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Value of the `event:` field, `None` when the frame had none.
    pub event: Option<String>,
    /// All `data:` lines joined with `\n`.
    pub data: String,
}

impl Frame {
    /// Event name, defaulting to `message` like a browser `EventSource`.
    pub fn name(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

/// Longest line kept in memory. A longer line is dropped together with
/// the frame it belongs to.
pub const DEFAULT_MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already searched for a newline.
    scanned: usize,
    max_line: usize,
    /// Inside an oversized line; bytes are dropped until its newline.
    skipping_line: bool,
    /// The current frame lost a line and is dropped on dispatch.
    damaged: bool,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_max_line(DEFAULT_MAX_LINE_BYTES)
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_line: max_line.max(1),
            skipping_line: false,
            damaged: false,
            event: None,
            data_lines: Vec::new(),
        }
    }

    /// Feed one chunk; returns every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.buffer[self.scanned..].iter().position(|&b| b == b'\n') {
            let end = self.scanned + offset;
            if self.skipping_line {
                self.skipping_line = false;
            } else {
                let line =
                    String::from_utf8_lossy(trim_cr(&self.buffer[start..end])).into_owned();
                frames.extend(self.process_line(&line));
            }
            start = end + 1;
            self.scanned = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.max_line {
            if !self.skipping_line {
                tracing::warn!(
                    bytes = self.buffer.len(),
                    limit = self.max_line,
                    "Event stream line too long, dropping its frame",
                );
            }
            self.buffer.clear();
            self.scanned = 0;
            self.skipping_line = true;
            self.damaged = true;
        }
        frames
    }

    /// Flush at end of stream: a trailing line without newline and a frame
    /// without its terminating blank line are still delivered.
    pub fn finish(&mut self) -> Option<Frame> {
        let line = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        if !line.is_empty() && !std::mem::take(&mut self.skipping_line) {
            let line = String::from_utf8_lossy(trim_cr(&line)).into_owned();
            if let Some(frame) = self.process_line(&line) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<Frame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data_lines.push(value.to_string()),
            // `id` and `retry` carry nothing this client uses.
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<Frame> {
        if std::mem::take(&mut self.damaged) {
            self.event = None;
            self.data_lines.clear();
            return None;
        }
        let event = self.event.take();
        if event.is_none() && self.data_lines.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data_lines).join("\n");
        Some(Frame { event, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = concat!(
        "event: batch_start\n",
        "data: {\"totalPointers\": 2}\n",
        "\n",
        ": keepalive\n",
        "\n",
        "event: pointer_complete\r\n",
        "data: {\"title\": \"Détail de façade, coupe ü\"}\r\n",
        "\r\n",
        "event: batch_complete\n",
        "data: {}\n",
        "\n",
    );

    fn decode_all(chunks: &[&[u8]]) -> Vec<Frame> {
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for chunk in chunks {
            frames.extend(decoder.push(chunk));
        }
        frames.extend(decoder.finish());
        frames
    }

    #[test]
    fn decodes_whole_body() {
        let frames = decode_all(&[STREAM.as_bytes()]);
        let names: Vec<_> = frames.iter().map(Frame::name).collect();
        assert_eq!(names, vec!["batch_start", "pointer_complete", "batch_complete"]);
        assert_eq!(frames[0].data, "{\"totalPointers\": 2}");
    }

    #[test]
    fn split_at_every_byte_yields_same_frames() {
        let bytes = STREAM.as_bytes();
        let expected = decode_all(&[bytes]);

        for split in 1..bytes.len() {
            let (a, b) = bytes.split_at(split);
            assert_eq!(decode_all(&[a, b]), expected, "split at byte {split}");
        }

        let singles: Vec<&[u8]> = bytes.chunks(1).collect();
        assert_eq!(decode_all(&singles), expected);
    }

    #[test]
    fn multiple_data_lines_are_joined() {
        let frames = decode_all(&[b"event: x\ndata: line one\ndata: line two\n\n".as_slice()]);
        assert_eq!(frames[0].data, "line one\nline two");
    }

    #[test]
    fn comments_alone_produce_nothing() {
        assert!(decode_all(&[b": keepalive\n\n: keepalive\n\n".as_slice()]).is_empty());
    }

    #[test]
    fn finish_flushes_unterminated_frame() {
        let frames = decode_all(&[b"event: batch_complete\ndata: {}".as_slice()]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].name(), "batch_complete");
        assert_eq!(frames[0].data, "{}");
    }

    #[test]
    fn long_line_fed_byte_by_byte() {
        let payload = "x".repeat(10_000);
        let body = format!("event: big\ndata: {payload}\n\n");
        let singles: Vec<&[u8]> = body.as_bytes().chunks(1).collect();
        let frames = decode_all(&singles);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, payload);
    }

    #[test]
    fn oversized_line_drops_its_frame_only() {
        let body = format!(
            "event: big\ndata: {}\ndata: tail\n\nevent: small\ndata: {{}}\n\n",
            "x".repeat(64)
        );
        let mut decoder = FrameDecoder::with_max_line(32);
        let mut frames = Vec::new();
        for chunk in body.as_bytes().chunks(5) {
            frames.extend(decoder.push(chunk));
        }
        frames.extend(decoder.finish());

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].name(), "small");
        assert_eq!(frames[0].data, "{}");
        assert!(decoder.buffer.len() <= 32);
    }

    #[test]
    fn frame_without_event_defaults_to_message() {
        let frames = decode_all(&[b"data: hi\n\n".as_slice()]);
        assert_eq!(frames[0].event, None);
        assert_eq!(frames[0].name(), "message");
    }
}
