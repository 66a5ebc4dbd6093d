//! STOMP frame model, encoder and incremental decoder.
//!
//! Wire format (STOMP 1.2):
//!
//! ```text
//! COMMAND\n
//! name:value\n
//! ...\n
//! \n
//! body\0
//! ```
//!
//! Lines may end in `\r\n`. Header names and values are escaped (`\\`, `\n`,
//! `\r`, `\c`) on every frame except `CONNECT` and `CONNECTED`. A
//! `content-length` header fixes the body size; otherwise the body runs to
//! the first NUL. Bare EOLs between frames are heart-beats and are skipped.

use std::fmt;

use crate::errors::{RelayError, Result};

/// Default upper bound on a single buffered frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// STOMP command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    // Client frames
    /// `CONNECT`
    Connect,
    /// `STOMP` (1.2 alias of `CONNECT`)
    Stomp,
    /// `SEND`
    Send,
    /// `SUBSCRIBE`
    Subscribe,
    /// `UNSUBSCRIBE`
    Unsubscribe,
    /// `ACK`
    Ack,
    /// `NACK`
    Nack,
    /// `BEGIN`
    Begin,
    /// `COMMIT`
    Commit,
    /// `ABORT`
    Abort,
    /// `DISCONNECT`
    Disconnect,

    // Server frames
    /// `CONNECTED`
    Connected,
    /// `MESSAGE`
    Message,
    /// `RECEIPT`
    Receipt,
    /// `ERROR`
    Error,
}

impl Command {
    /// Parse a command line. Returns `None` for unknown commands.
    pub fn parse(line: &str) -> Option<Self> {
        let cmd = match line {
            "CONNECT" => Self::Connect,
            "STOMP" => Self::Stomp,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "ACK" => Self::Ack,
            "NACK" => Self::Nack,
            "BEGIN" => Self::Begin,
            "COMMIT" => Self::Commit,
            "ABORT" => Self::Abort,
            "DISCONNECT" => Self::Disconnect,
            "CONNECTED" => Self::Connected,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            _ => return None,
        };
        Some(cmd)
    }

    /// Wire name of the command.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Stomp => "STOMP",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Ack => "ACK",
            Self::Nack => "NACK",
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Abort => "ABORT",
            Self::Disconnect => "DISCONNECT",
            Self::Connected => "CONNECTED",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    /// `CONNECT`/`CONNECTED` headers are never escaped.
    fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One STOMP frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Frame command.
    pub command: Command,
    headers: Vec<(String, String)>,
    /// Frame body, passed through untouched.
    pub body: String,
}

impl Frame {
    /// Create a frame with no headers and an empty body.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Replace the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Build an `ERROR` frame with a short `message` header and optional
    /// detail body.
    pub fn error(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(Command::Error)
            .with_header("message", message)
            .with_header("content-type", "text/plain")
            .with_body(detail)
    }

    /// First value of a header. Repeated headers keep the first occurrence.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Header value that the frame cannot be processed without.
    pub fn require_header(&self, name: &str) -> Result<&str> {
        self.header(name).ok_or_else(|| {
            RelayError::MalformedFrame(format!(
                "{} frame is missing required header '{name}'",
                self.command
            ))
        })
    }

    /// All headers in wire order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Serialize to wire text. A `content-length` header is added for
    /// non-empty bodies when the frame does not carry one.
    pub fn encode(&self) -> String {
        let escape_headers = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape_headers {
                push_escaped(&mut out, name);
                out.push(':');
                push_escaped(&mut out, value);
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.header("content-length").is_none() {
            out.push_str("content-length:");
            out.push_str(&self.body.len().to_string());
            out.push('\n');
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse exactly one complete frame.
    pub fn parse(input: &str) -> Result<Self> {
        let mut decoder = FrameDecoder::new(input.len().max(DEFAULT_MAX_FRAME_SIZE));
        let mut frames = decoder.decode(input)?;
        if !decoder.is_empty() {
            return Err(RelayError::MalformedFrame("incomplete frame".into()));
        }
        match frames.len() {
            1 => Ok(frames.remove(0)),
            0 => Err(RelayError::MalformedFrame("no frame in input".into())),
            n => Err(RelayError::MalformedFrame(format!("expected one frame, found {n}"))),
        }
    }
}

/// Incremental decoder: buffers partial input across transport messages and
/// yields every complete frame.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: String,
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a decoder that rejects frames larger than `max_frame_size`.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: String::new(),
            max_frame_size,
        }
    }

    /// Whether no partial frame is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Feed a chunk of text and return every frame it completes.
    pub fn decode(&mut self, chunk: &str) -> Result<Vec<Frame>> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();
        loop {
            let heartbeat = self.buffer.len() - self.buffer.trim_start_matches(['\n', '\r']).len();
            if heartbeat > 0 {
                let _ = self.buffer.drain(..heartbeat);
            }
            if self.buffer.is_empty() {
                break;
            }
            match decode_frame(&self.buffer, self.max_frame_size) {
                Ok(Some((frame, consumed))) => {
                    let _ = self.buffer.drain(..consumed);
                    frames.push(frame);
                }
                Ok(None) => {
                    if self.buffer.len() > self.max_frame_size {
                        self.buffer.clear();
                        return Err(RelayError::MalformedFrame(format!(
                            "frame exceeds {} bytes",
                            self.max_frame_size
                        )));
                    }
                    break;
                }
                Err(e) => {
                    self.buffer.clear();
                    return Err(e);
                }
            }
        }
        Ok(frames)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

/// Decode one frame from the start of `buf`.
///
/// `Ok(None)` means more input is needed. On success returns the frame and
/// the number of bytes consumed including the trailing NUL. A declared
/// `content-length` above `max_frame_size` is rejected up front.
fn decode_frame(buf: &str, max_frame_size: usize) -> Result<Option<(Frame, usize)>> {
    let mut pos = 0;

    let Some(nl) = buf.find('\n') else {
        return Ok(None);
    };
    let command_line = trim_cr(&buf[..nl]);
    pos += nl + 1;
    let command = Command::parse(command_line).ok_or_else(|| {
        RelayError::MalformedFrame(format!("unknown command '{}'", truncate(command_line)))
    })?;

    let mut headers = Vec::new();
    loop {
        let Some(nl) = buf[pos..].find('\n') else {
            return Ok(None);
        };
        let line = trim_cr(&buf[pos..pos + nl]);
        pos += nl + 1;
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| {
            RelayError::MalformedFrame(format!("header line without ':' ({})", truncate(line)))
        })?;
        if command.escapes_headers() {
            headers.push((unescape(name)?, unescape(value)?));
        } else {
            headers.push((name.to_owned(), value.to_owned()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(n, _)| n == "content-length")
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| RelayError::MalformedFrame(format!("invalid content-length '{v}'")))
        })
        .transpose()?;

    let body_end = match content_length {
        Some(len) => {
            if len > max_frame_size {
                return Err(RelayError::MalformedFrame(format!(
                    "content-length {len} exceeds {max_frame_size} bytes"
                )));
            }
            let end = pos.checked_add(len).ok_or_else(|| {
                RelayError::MalformedFrame(format!("content-length {len} out of range"))
            })?;
            if buf.len() <= end {
                return Ok(None);
            }
            // A NUL byte is always a char boundary, so slicing below is safe.
            if buf.as_bytes()[end] != 0 {
                return Err(RelayError::MalformedFrame(
                    "body longer than content-length".into(),
                ));
            }
            end
        }
        None => match buf[pos..].find('\0') {
            Some(i) => pos + i,
            None => return Ok(None),
        },
    };

    let frame = Frame {
        command,
        headers,
        body: buf[pos..body_end].to_owned(),
    };
    Ok(Some((frame, body_end + 1)))
}

fn trim_cr(line: &str) -> &str {
    line.strip_suffix('\r').unwrap_or(line)
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(32) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}

fn push_escaped(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            _ => out.push(c),
        }
    }
}

fn unescape(s: &str) -> Result<String> {
    if !s.contains('\\') {
        return Ok(s.to_owned());
    }
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            Some(other) => {
                return Err(RelayError::MalformedFrame(format!(
                    "undefined escape sequence '\\{other}'"
                )));
            }
            None => {
                return Err(RelayError::MalformedFrame("dangling escape".into()));
            }
        }
    }
    Ok(out)
}
