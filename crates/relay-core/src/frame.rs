//! Text wire format shared by the stream endpoint and its clients.
//!
//! One event per frame, frames separated by a blank line:
//!
//! ```text
//! data: {"type":"task_created","payload":{"boardId":"b1","taskId":"t1"}}
//!
//! : heartbeat
//!
//! ```
//!
//! Lines starting with `:` are comments (connection markers and heartbeats)
//! and never reach event handlers.

use crate::errors::FrameError;
use crate::events::Event;

/// Sent once when a stream opens so buffering proxies flush immediately.
pub const CONNECTED_FRAME: &str = ": connected\n\n";
/// Sent on every heartbeat tick.
pub const HEARTBEAT_FRAME: &str = ": heartbeat\n\n";

/// Serialize an event as a `data:` frame.
pub fn encode_event(event: &Event) -> Result<String, FrameError> {
    let json = serde_json::to_string(event).map_err(FrameError::Serialize)?;
    Ok(format!("data: {json}\n\n"))
}

/// Build a comment frame. Newlines in `text` are replaced with spaces.
pub fn comment_frame(text: &str) -> String {
    format!(": {}\n\n", text.replace(['\r', '\n'], " "))
}

/// A decoded frame.
#[derive(Debug)]
pub enum Frame {
    Data(Event),
    Comment(String),
    Malformed(FrameError),
}

impl Frame {
    pub fn is_comment(&self) -> bool {
        matches!(self, Self::Comment(_))
    }
}

/// Largest frame the decoder buffers before giving up on it.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Incremental decoder: feed arbitrary chunks, get complete frames back.
///
/// Chunks may split frames, lines and multi-byte UTF-8 sequences anywhere.
/// A frame that grows past the size limit is reported once as
/// [`FrameError::Oversized`] and the rest of it is skipped up to the next
/// blank line.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: String,
    partial_utf8: Vec<u8>,
    /// Prefix of `buffer` already searched for a terminator.
    scanned: usize,
    max_frame_bytes: usize,
    /// Inside an oversized frame; input is dropped until it ends.
    skipping: bool,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_bytes(limit: usize) -> Self {
        Self {
            buffer: String::new(),
            partial_utf8: Vec::new(),
            scanned: 0,
            max_frame_bytes: limit.max(1),
            skipping: false,
        }
    }

    /// Append raw bytes and return every frame completed by them.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<Frame> {
        self.partial_utf8.extend_from_slice(bytes);
        let pending = std::mem::take(&mut self.partial_utf8);

        match std::str::from_utf8(&pending) {
            Ok(text) => self.append(text),
            Err(e) if e.error_len().is_none() => {
                // Incomplete trailing sequence: keep it for the next chunk.
                let valid = e.valid_up_to();
                self.append(&String::from_utf8_lossy(&pending[..valid]));
                self.partial_utf8.extend_from_slice(&pending[valid..]);
            }
            Err(_) => self.append(&String::from_utf8_lossy(&pending)),
        }

        self.drain_complete()
    }

    /// Append text and return every frame completed by it.
    pub fn push(&mut self, chunk: &str) -> Vec<Frame> {
        self.append(chunk);
        self.drain_complete()
    }

    /// Decode whatever remains once the underlying stream has ended.
    pub fn finish(&mut self) -> Vec<Frame> {
        if !self.partial_utf8.is_empty() {
            let rest = std::mem::take(&mut self.partial_utf8);
            self.append(&String::from_utf8_lossy(&rest));
        }
        let remaining = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        if std::mem::take(&mut self.skipping) {
            return Vec::new();
        }
        parse_block(&remaining).into_iter().collect()
    }

    /// Bytes buffered but not yet forming a complete frame.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len() + self.partial_utf8.len()
    }

    /// Append with CRLF folded to LF, including a pair split across chunks.
    fn append(&mut self, text: &str) {
        if text.starts_with('\n') && self.buffer.ends_with('\r') {
            let _ = self.buffer.pop();
        }
        if text.contains("\r\n") {
            self.buffer.push_str(&text.replace("\r\n", "\n"));
        } else {
            self.buffer.push_str(text);
        }
    }

    fn drain_complete(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        loop {
            // A terminator may straddle the previously scanned prefix.
            let from = self.scanned.saturating_sub(1);
            let Some(found) = self.buffer.as_bytes()[from..]
                .windows(2)
                .position(|pair| pair == b"\n\n")
            else {
                break;
            };
            let end = from + found + 2;
            self.scanned = 0;

            if self.skipping {
                self.buffer.drain(..end);
                self.skipping = false;
                continue;
            }
            if end > self.max_frame_bytes {
                self.buffer.drain(..end);
                frames.push(self.oversized());
                continue;
            }
            let block: String = self.buffer.drain(..end).collect();
            if let Some(frame) = parse_block(&block) {
                frames.push(frame);
            }
        }
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.max_frame_bytes || (self.skipping && !self.buffer.is_empty()) {
            if !self.skipping {
                frames.push(self.oversized());
                self.skipping = true;
            }
            // Keep a trailing newline: it may be the first half of the terminator.
            let keep_newline = self.buffer.ends_with('\n');
            self.buffer.clear();
            if keep_newline {
                self.buffer.push('\n');
            }
            self.scanned = self.buffer.len();
        }
        frames
    }

    fn oversized(&self) -> Frame {
        Frame::Malformed(FrameError::Oversized {
            limit: self.max_frame_bytes,
        })
    }
}

/// Parse one blank-line-terminated block into a frame.
///
/// Multiple `data:` lines are joined with `\n`. `event:`, `id:` and
/// `retry:` fields are accepted and ignored.
fn parse_block(block: &str) -> Option<Frame> {
    let mut data_lines: Vec<&str> = Vec::new();
    let mut comment: Option<&str> = None;

    for line in block.lines() {
        if let Some(text) = line.strip_prefix(':') {
            if comment.is_none() {
                comment = Some(text.trim_start());
            }
        } else if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.strip_prefix(' ').unwrap_or(data));
        }
    }

    if !data_lines.is_empty() {
        let raw = data_lines.join("\n");
        return Some(match serde_json::from_str::<Event>(&raw) {
            Ok(event) => Frame::Data(event),
            Err(e) => Frame::Malformed(FrameError::Malformed {
                reason: e.to_string(),
                raw,
            }),
        });
    }

    comment.map(|text| Frame::Comment(text.to_string()))
}
