//! Wire frame codec: `\r\n`-delimited request and response frames

use serde::{Deserialize, Serialize};

pub const CODE_OK: u16 = 200;
pub const CODE_BAD_ARGS: u16 = 400;
pub const CODE_NOT_FOUND: u16 = 404;
pub const CODE_DUPLICATE: u16 = 409;
pub const CODE_SERVER_ERROR: u16 = 500;

/// Frame delimiter on the wire.
pub const DELIMITER: &[u8; 2] = b"\r\n";

/// Request id used when none could be extracted from a bad frame.
pub const UNKNOWN_REQUEST_ID: &str = "0";

/// A parsed inbound request.
///
/// Two encodings are accepted: the text form `<id> <COMMAND> <args...>` and
/// a JSON object carrying the same fields. The command tag is left as sent;
/// command parsing uppercases it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
  pub id: String,
  pub command: String,
  #[serde(default)]
  pub args: Vec<String>,
}

/// Request parse failure.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
  /// Blank frame.
  Empty,
  /// Text form with an id but no command token.
  MissingCommand,
  /// Frame started like the structured form but did not decode.
  Invalid(String),
}

impl std::fmt::Display for ParseError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ParseError::Empty => write!(f, "empty frame"),
      ParseError::MissingCommand => write!(f, "missing command"),
      ParseError::Invalid(msg) => write!(f, "invalid frame: {}", msg),
    }
  }
}

impl std::error::Error for ParseError {}

/// Parse one frame into a request, accepting either encoding.
pub fn parse_request(line: &str) -> Result<Request, ParseError> {
  let line = line.trim();
  if line.is_empty() {
    return Err(ParseError::Empty);
  }

  if line.starts_with('{') {
    let req: Request =
      serde_json::from_str(line).map_err(|e| ParseError::Invalid(e.to_string()))?;
    if req.id.is_empty() || req.command.is_empty() {
      return Err(ParseError::Invalid("id and command are required".to_string()));
    }
    return Ok(req);
  }

  let mut tokens = line.split_whitespace();
  let id = tokens.next().ok_or(ParseError::Empty)?.to_string();
  let command = tokens.next().ok_or(ParseError::MissingCommand)?.to_string();
  let args: Vec<String> = tokens.map(String::from).collect();
  Ok(Request { id, command, args })
}

/// Best-effort request id for an error response to an unparseable frame.
pub fn fallback_id(line: &str) -> String {
  let line = line.trim();
  if line.is_empty() || line.starts_with('{') {
    return UNKNOWN_REQUEST_ID.to_string();
  }
  line
    .split_whitespace()
    .next()
    .unwrap_or(UNKNOWN_REQUEST_ID)
    .to_string()
}

/// Outbound frame category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
  Response,
  Event,
  Error,
}

/// An outbound frame, serialized as one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
  #[serde(rename = "requestId")]
  pub request_id: String,
  #[serde(rename = "type")]
  pub frame_type: FrameType,
  pub code: u16,
  pub message: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub value: Option<String>,
}

impl Frame {
  pub fn response(request_id: &str, message: impl Into<String>) -> Self {
    Self {
      request_id: request_id.to_string(),
      frame_type: FrameType::Response,
      code: CODE_OK,
      message: message.into(),
      value: None,
    }
  }

  pub fn response_with_value(
    request_id: &str,
    message: impl Into<String>,
    value: impl Into<String>,
  ) -> Self {
    Self {
      value: Some(value.into()),
      ..Self::response(request_id, message)
    }
  }

  pub fn error(request_id: &str, code: u16, message: impl Into<String>) -> Self {
    Self {
      request_id: request_id.to_string(),
      frame_type: FrameType::Error,
      code,
      message: message.into(),
      value: None,
    }
  }

  pub fn event(event_id: String, message: impl Into<String>, value: Option<String>) -> Self {
    Self {
      request_id: event_id,
      frame_type: FrameType::Event,
      code: CODE_OK,
      message: message.into(),
      value,
    }
  }

  /// Encode to wire bytes, delimiter included.
  pub fn encode(&self) -> Vec<u8> {
    let mut buf = serde_json::to_vec(self).unwrap_or_default();
    buf.extend_from_slice(DELIMITER);
    buf
  }
}

/// Incremental splitter for `\r\n`-delimited frames.
pub struct FrameReader {
  buffer: Vec<u8>,
}

impl Default for FrameReader {
  fn default() -> Self {
    Self::new()
  }
}

impl FrameReader {
  pub fn new() -> Self {
    Self { buffer: Vec::new() }
  }

  /// Add bytes to the frame buffer.
  pub fn feed(&mut self, data: &[u8]) {
    self.buffer.extend_from_slice(data);
  }

  /// Pop the next complete frame, or `None` until more bytes arrive.
  pub fn next_frame(&mut self) -> Option<String> {
    let pos = self
      .buffer
      .windows(2)
      .position(|w| w == DELIMITER)?;
    let line = String::from_utf8_lossy(&self.buffer[..pos]).to_string();
    self.buffer.drain(..pos + 2);
    Some(line)
  }
}
