use crate::error::FrameError;

/// One server-sent-events record with its `data:` lines joined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental splitter for a chunked `text/event-stream` body.
///
/// Chunks may end anywhere, including inside a multi-byte character or
/// between the `\r` and `\n` of a line ending, so bytes are buffered until a
/// blank line closes the record.
#[derive(Debug)]
pub struct SseFrameReader {
    buffer: Vec<u8>,
    max_frame_len: usize,
    discarding: bool,
}

impl SseFrameReader {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_frame_len,
            discarding: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<SseFrame, FrameError>> {
        self.buffer
            .extend(chunk.iter().copied().filter(|byte| *byte != b'\r'));

        let mut frames = Vec::new();
        while let Some(idx) = find_boundary(&self.buffer) {
            let record: Vec<u8> = self.buffer.drain(..idx + 2).collect();
            if self.discarding {
                // Tail of an oversized record.
                self.discarding = false;
                continue;
            }
            if let Some(frame) = parse_record(&record[..idx]).transpose() {
                frames.push(frame);
            }
        }

        if self.buffer.len() > self.max_frame_len {
            if !self.discarding {
                frames.push(Err(FrameError::Oversized {
                    len: self.buffer.len(),
                    limit: self.max_frame_len,
                }));
            }
            self.buffer.clear();
            self.discarding = true;
        }

        frames
    }

    /// Flushes a final record the server did not terminate with a blank line.
    pub fn finish(&mut self) -> Option<Result<SseFrame, FrameError>> {
        let record = std::mem::take(&mut self.buffer);
        if std::mem::take(&mut self.discarding) {
            return None;
        }
        parse_record(&record).transpose()
    }
}

fn find_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|pair| pair == b"\n\n")
}

fn parse_record(raw: &[u8]) -> Result<Option<SseFrame>, FrameError> {
    let raw = std::str::from_utf8(raw).map_err(|_| FrameError::InvalidUtf8)?;

    let mut event = None;
    let mut data_lines = Vec::new();
    for line in raw.lines() {
        if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.strip_prefix(' ').unwrap_or(data));
        } else if let Some(name) = line.strip_prefix("event:") {
            event = Some(name.trim().to_string());
        }
        // Comments (`:keep-alive`), `id:` and `retry:` carry nothing we fold.
    }

    if data_lines.is_empty() {
        Ok(None)
    } else {
        Ok(Some(SseFrame {
            event,
            data: data_lines.join("\n"),
        }))
    }
}
