//! The frame codec: one protocol message to and from bytes.
//!
//! Wire layout, after a 4 byte big-endian length prefix covering
//! everything that follows:
//!
//! ```text
//! [36 bytes correlation id][4 bytes body format tag]
//! KEY: VALUE\n        (zero or more header lines)
//! route-or-status\n
//! \n
//! <body bytes>
//! ```
//!
//! The split between the text region and the body is the first `\n\n`
//! pair; the body itself is never scanned, so BINARY payloads may
//! contain anything. The length prefix is always recomputed from the
//! assembled message on encode, never caller-supplied.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::{FrameError, MAX_FRAME_LEN};
use super::fields::{self, Fields};
use crate::definitions::CORRELATION_ID_LEN;

const TAG_STRUCTURED: [u8; 4] = *b"STRC";
const TAG_BINARY: [u8; 4] = *b"BNRY";

const FIXED_HEADER_LEN: usize = CORRELATION_ID_LEN + 4;

/// Response outcome codes; a closed set, numeric on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    NewUser,
    BadRequest,
    WrongPassword,
    NoPermission,
    NotFound,
    NoWorkspace,
    NoUser,
    InternalError,
    GenericFailure,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::NewUser => 201,
            Status::BadRequest => 400,
            Status::WrongPassword => 401,
            Status::NoPermission => 403,
            Status::NotFound => 404,
            Status::NoWorkspace => 430,
            Status::NoUser => 431,
            Status::InternalError => 500,
            Status::GenericFailure => 520,
        }
    }

    pub fn from_code(code: u16) -> Option<Status> {
        Some(match code {
            200 => Status::Ok,
            201 => Status::NewUser,
            400 => Status::BadRequest,
            401 => Status::WrongPassword,
            403 => Status::NoPermission,
            404 => Status::NotFound,
            430 => Status::NoWorkspace,
            431 => Status::NoUser,
            500 => Status::InternalError,
            520 => Status::GenericFailure,
            _ => return None,
        })
    }

    pub fn is_accept(self) -> bool {
        matches!(self, Status::Ok | Status::NewUser)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.code())
    }
}

/// A message body, with the format tag implied by the variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Structured(Fields),
    Binary(Bytes),
}

impl Body {
    fn tag(&self) -> [u8; 4] {
        match self {
            Body::Structured(_) => TAG_STRUCTURED,
            Body::Binary(_) => TAG_BINARY,
        }
    }

    pub fn empty() -> Body {
        Body::Structured(Fields::new())
    }
}

/// Whether a message selects an operation or reports an outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Kind {
    Request { route: String },
    Response { status: Status },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Correlation token, exactly [CORRELATION_ID_LEN] bytes. For
    /// chunk traffic this is the transfer id.
    pub correlation_id: String,
    /// Out-of-band metadata such as chunk indices. Keys and values
    /// are restricted to `[A-Za-z0-9-]+`.
    pub headers: Fields,
    pub kind: Kind,
    pub body: Body,
}

impl Message {
    pub fn request(route: impl Into<String>) -> Message {
        Message {
            correlation_id: uuid::Uuid::new_v4().to_string(),
            headers: Fields::new(),
            kind: Kind::Request {
                route: route.into(),
            },
            body: Body::empty(),
        }
    }

    pub fn response(status: Status, correlation_id: impl Into<String>) -> Message {
        Message {
            correlation_id: correlation_id.into(),
            headers: Fields::new(),
            kind: Kind::Response { status },
            body: Body::empty(),
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Message {
        self.correlation_id = id.into();
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Message {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Message {
        match &mut self.body {
            Body::Structured(fields) => {
                fields.insert(key.into(), value.into());
            }
            Body::Binary(_) => {
                let mut fields = Fields::new();
                fields.insert(key.into(), value.into());
                self.body = Body::Structured(fields);
            }
        }
        self
    }

    pub fn with_binary(mut self, payload: impl Into<Bytes>) -> Message {
        self.body = Body::Binary(payload.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&str> {
        match &self.body {
            Body::Structured(fields) => fields.get(key).map(String::as_str),
            Body::Binary(_) => None,
        }
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn status(&self) -> Option<Status> {
        match self.kind {
            Kind::Response { status } => Some(status),
            Kind::Request { .. } => None,
        }
    }
}

fn valid_correlation_id(id: &str) -> bool {
    id.len() == CORRELATION_ID_LEN
        && id.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

fn valid_header_token(token: &str) -> bool {
    !token.is_empty()
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

fn valid_route(route: &str) -> bool {
    !route.is_empty() && route.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Serialize a message, including the length prefix.
pub fn encode(message: &Message) -> Result<Vec<u8>, FrameError> {
    if !valid_correlation_id(&message.correlation_id) {
        return Err(FrameError::CorrelationId(message.correlation_id.clone()));
    }

    let mut text = String::new();
    for (key, value) in &message.headers {
        if !valid_header_token(key) || !valid_header_token(value) {
            return Err(FrameError::Header(format!("{key}: {value}")));
        }
        text.push_str(key);
        text.push_str(": ");
        text.push_str(value);
        text.push('\n');
    }
    match &message.kind {
        Kind::Request { route } => {
            if !valid_route(route) {
                return Err(FrameError::Route(route.clone()));
            }
            text.push_str(route);
        }
        Kind::Response { status } => {
            text.push_str(&status.code().to_string());
        }
    }
    text.push('\n');
    text.push('\n');

    match &message.body {
        Body::Structured(fields) => assemble(message, &text, fields::encode(fields).as_bytes()),
        Body::Binary(payload) => assemble(message, &text, payload),
    }
}

fn assemble(message: &Message, text: &str, body: &[u8]) -> Result<Vec<u8>, FrameError> {
    let length = FIXED_HEADER_LEN + text.len() + body.len();
    let Ok(length) = u32::try_from(length) else {
        return Err(FrameError::Oversize(u32::MAX));
    };
    if length > MAX_FRAME_LEN {
        return Err(FrameError::Oversize(length));
    }

    let mut frame = Vec::with_capacity(4 + length as usize);
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(message.correlation_id.as_bytes());
    frame.extend_from_slice(&message.body.tag());
    frame.extend_from_slice(text.as_bytes());
    frame.extend_from_slice(body);

    Ok(frame)
}

struct SplitFrame<'a> {
    correlation_id: &'a str,
    structured: bool,
    headers: Fields,
    last_line: &'a str,
    body: &'a [u8],
}

/// Two-phase parse of a frame (without its length prefix): fixed
/// header, then the text region up to the first `\n\n`, then the body
/// as the exact remainder.
fn split(frame: &[u8]) -> Result<SplitFrame<'_>, FrameError> {
    if frame.len() < FIXED_HEADER_LEN {
        return Err(FrameError::Truncated);
    }

    let correlation_id = std::str::from_utf8(&frame[..CORRELATION_ID_LEN])
        .map_err(|_| FrameError::CorrelationId(String::from("<non-utf8>")))?;
    if !valid_correlation_id(correlation_id) {
        return Err(FrameError::CorrelationId(correlation_id.into()));
    }

    let tag: [u8; 4] = frame[CORRELATION_ID_LEN..FIXED_HEADER_LEN]
        .try_into()
        .expect("fixed-width slice");
    let structured = match tag {
        TAG_STRUCTURED => true,
        TAG_BINARY => false,
        other => return Err(FrameError::UnknownFormat(other)),
    };

    let rest = &frame[FIXED_HEADER_LEN..];
    let separator = rest
        .windows(2)
        .position(|pair| pair == b"\n\n")
        .ok_or(FrameError::MissingSeparator)?;
    let text = std::str::from_utf8(&rest[..separator]).map_err(|_| FrameError::Utf8)?;
    let body = &rest[separator + 2..];

    let mut headers = Fields::new();
    let mut last_line = "";
    let mut lines = text.lines().peekable();
    while let Some(line) = lines.next() {
        if lines.peek().is_none() {
            last_line = line;
            break;
        }
        let (key, value) = line
            .split_once(": ")
            .ok_or_else(|| FrameError::Header(line.into()))?;
        if !valid_header_token(key) || !valid_header_token(value) {
            return Err(FrameError::Header(line.into()));
        }
        headers.insert(key.into(), value.into());
    }
    if last_line.is_empty() {
        return Err(FrameError::MissingSeparator);
    }

    Ok(SplitFrame {
        correlation_id,
        structured,
        headers,
        last_line,
        body,
    })
}

fn decode_body(structured: bool, body: &[u8]) -> Result<Body, FrameError> {
    if structured {
        let text = std::str::from_utf8(body).map_err(|_| FrameError::Utf8)?;
        Ok(Body::Structured(fields::decode(text)?))
    } else {
        Ok(Body::Binary(Bytes::copy_from_slice(body)))
    }
}

/// Decode a request frame (without its length prefix).
pub fn decode_request(frame: &[u8]) -> Result<Message, FrameError> {
    let split = split(frame)?;

    if !valid_route(split.last_line) {
        return Err(FrameError::Route(split.last_line.into()));
    }

    Ok(Message {
        correlation_id: split.correlation_id.into(),
        headers: split.headers,
        kind: Kind::Request {
            route: split.last_line.into(),
        },
        body: decode_body(split.structured, split.body)?,
    })
}

/// Decode a response frame (without its length prefix).
pub fn decode_response(frame: &[u8]) -> Result<Message, FrameError> {
    let split = split(frame)?;

    let status = split
        .last_line
        .parse::<u16>()
        .ok()
        .and_then(Status::from_code)
        .ok_or_else(|| FrameError::Status(split.last_line.into()))?;

    Ok(Message {
        correlation_id: split.correlation_id.into(),
        headers: split.headers,
        kind: Kind::Response { status },
        body: decode_body(split.structured, split.body)?,
    })
}

/// Read one length-prefixed frame; `Ok(None)` on a clean end of
/// stream before the first byte.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut length = [0u8; 4];
    match reader.read_exact(&mut length).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes(length);
    if length > MAX_FRAME_LEN {
        return Err(FrameError::Oversize(length));
    }
    if (length as usize) < FIXED_HEADER_LEN {
        return Err(FrameError::Truncated);
    }

    let mut frame = vec![0u8; length as usize];
    reader.read_exact(&mut frame).await?;

    Ok(Some(frame))
}

pub async fn read_request<R>(reader: &mut R) -> Result<Option<Message>, FrameError>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader).await? {
        Some(frame) => Ok(Some(decode_request(&frame)?)),
        None => Ok(None),
    }
}

pub async fn read_response<R>(reader: &mut R) -> Result<Option<Message>, FrameError>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader).await? {
        Some(frame) => Ok(Some(decode_response(&frame)?)),
        None => Ok(None),
    }
}

pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    #[test]
    fn request_round_trip() {
        let message = Message::request("uploadfiletoworkspace")
            .with_field("action", "init")
            .with_field("target", "report.txt")
            .with_field("size", "307200")
            .with_header("TYPE", "CONTROL");

        let decoded = decode_request(&encode(&message).unwrap()[4..]).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn response_round_trip() {
        let message = Message::response(Status::NoPermission, fresh_id())
            .with_field("reason", "not a member");

        let decoded = decode_response(&encode(&message).unwrap()[4..]).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn binary_round_trip_with_embedded_separators() {
        // a body full of newlines must never confuse the text scan
        let payload: Vec<u8> = b"\n\nchunk\n\npayload\n\n".repeat(100);
        let message = Message::request("uploadfiletoworkspace")
            .with_header("FILE-ID", fresh_id())
            .with_header("CHUNK-ID", "3")
            .with_header("TYPE", "CHUNK")
            .with_binary(payload.clone());

        let decoded = decode_request(&encode(&message).unwrap()[4..]).unwrap();
        assert_eq!(decoded.body, Body::Binary(payload.into()));
        assert_eq!(decoded, message);
    }

    #[test]
    fn empty_binary_body() {
        let message = Message::response(Status::Ok, fresh_id()).with_binary(Vec::new());
        let decoded = decode_response(&encode(&message).unwrap()[4..]).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn length_prefix_is_exact() {
        let message = Message::request("listworkspaces").with_field("k", "v");
        let frame = encode(&message).unwrap();
        let length = u32::from_be_bytes(frame[..4].try_into().unwrap());
        assert_eq!(length as usize, frame.len() - 4);
    }

    #[test]
    fn rejects_bad_route() {
        let message = Message::request("no spaces allowed");
        assert!(matches!(encode(&message), Err(FrameError::Route(_))));

        let ok = encode(&Message::request("route1")).unwrap();
        // splice an invalid route into an otherwise valid frame
        let mangled = String::from_utf8(ok[4..].to_vec())
            .unwrap()
            .replace("route1", "$$$$$$");
        assert!(matches!(
            decode_request(mangled.as_bytes()),
            Err(FrameError::Route(_))
        ));
    }

    #[test]
    fn rejects_bad_header_characters() {
        let message = Message::request("route").with_header("bad key", "v");
        assert!(matches!(encode(&message), Err(FrameError::Header(_))));

        let message = Message::request("route").with_header("KEY", "bad value");
        assert!(matches!(encode(&message), Err(FrameError::Header(_))));
    }

    #[test]
    fn rejects_unknown_format_tag() {
        let mut frame = encode(&Message::request("route")).unwrap();
        frame[4 + CORRELATION_ID_LEN..4 + FIXED_HEADER_LEN].copy_from_slice(b"WAT?");
        assert!(matches!(
            decode_request(&frame[4..]),
            Err(FrameError::UnknownFormat(_))
        ));
    }

    #[test]
    fn rejects_missing_separator() {
        let frame = encode(&Message::request("route")).unwrap();
        // drop everything from the separator onwards
        let cut = frame[4..].len() - 2;
        assert!(matches!(
            decode_request(&frame[4..4 + cut]),
            Err(FrameError::MissingSeparator)
        ));
    }

    #[test]
    fn rejects_short_frame() {
        assert!(matches!(
            decode_request(&[0u8; 10]),
            Err(FrameError::Truncated)
        ));
    }

    #[test]
    fn rejects_unknown_status() {
        let frame = encode(&Message::response(Status::Ok, fresh_id())).unwrap();
        let mangled = String::from_utf8(frame[4..].to_vec())
            .unwrap()
            .replace("200", "999");
        assert!(matches!(
            decode_response(mangled.as_bytes()),
            Err(FrameError::Status(_))
        ));
    }

    #[tokio::test]
    async fn stream_round_trip_and_clean_eof() {
        let first = Message::request("authenticate")
            .with_field("user", "alice")
            .with_field("secret", "hunter2");
        let second = Message::response(Status::Ok, first.correlation_id.clone());

        let mut buffer = Vec::new();
        write_message(&mut buffer, &first).await.unwrap();
        write_message(&mut buffer, &second).await.unwrap();

        let mut reader = buffer.as_slice();
        assert_eq!(read_request(&mut reader).await.unwrap(), Some(first));
        assert_eq!(
            read_response(&mut reader).await.unwrap(),
            Some(second)
        );
        assert_eq!(read_frame(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn oversize_length_prefix_is_fatal() {
        let mut reader: &[u8] = &u32::to_be_bytes(MAX_FRAME_LEN + 1);
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(FrameError::Oversize(_))
        ));
    }
}
