//! Incremental HTTP/1.x message scanner.
//!
//! A resumable state machine over request/response start lines, header
//! fields, and bodies. Input arrives in arbitrarily segmented buffers; the
//! scanner emits borrowed span events for the elements of interest (URL,
//! header name, header value, body data) without buffering them itself. A
//! span whose element runs past the end of the current buffer is emitted
//! with `complete` cleared and continued on the next call.
//!
//! Body framing follows Content-Length, chunked transfer encoding, or (for
//! responses with neither) read-to-end. After a message completes the
//! scanner returns to its start state, so pipelined messages on one stream
//! parse back to back.

use std::str::{self, FromStr};

use memchr::{memchr, memchr2};
use strum_macros::EnumString;
use thiserror::Error;

/// Whether a message is a request or a response.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MessageKind {
    Request,
    Response,
}

/// Request method.
#[derive(Debug, Copy, Clone, Eq, PartialEq, EnumString)]
pub enum Method {
    #[strum(serialize = "GET")]
    Get,
    #[strum(serialize = "HEAD")]
    Head,
    #[strum(serialize = "POST")]
    Post,
    #[strum(serialize = "PUT")]
    Put,
    #[strum(serialize = "DELETE")]
    Delete,
    #[strum(serialize = "CONNECT")]
    Connect,
    #[strum(serialize = "OPTIONS")]
    Options,
    #[strum(serialize = "TRACE")]
    Trace,
    #[strum(serialize = "PATCH")]
    Patch,
}

/// The request method or response status code, depending on message kind.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MethodOrStatus {
    Method(Method),
    Status(u16),
}

/// Start-line identity of the message a span belongs to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MessageInfo {
    pub version_major: u8,
    pub version_minor: u8,
    pub kind: MessageKind,
    pub method_or_status: MethodOrStatus,
}

/// Element a span belongs to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum SpanKind {
    Url,
    HeaderName,
    HeaderValue,
    Body,
    /// Zero-length marker emitted when a message ends.
    MessageEnd,
}

/// A slice of one message element. `complete` is set when the element ends
/// within the current buffer; cleared when it continues in the next
/// segment.
#[derive(Debug, PartialEq)]
pub(crate) struct SpanEvent<'a> {
    pub(crate) kind: SpanKind,
    pub(crate) data: &'a [u8],
    pub(crate) complete: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub(crate) enum ParseError {
    #[error("unrecognised request method")]
    BadMethod,
    #[error("malformed request line")]
    BadRequestLine,
    #[error("malformed http version")]
    BadVersion,
    #[error("malformed status code")]
    BadStatus,
    #[error("header line without separator")]
    BadHeader,
    #[error("unparsable content-length")]
    BadContentLength,
    #[error("malformed chunk size")]
    BadChunkSize,
    #[error("bare CR or missing LF")]
    BadLineEnd,
    #[error("token exceeds scanner limit")]
    TokenTooLong,
}

/// Small bounded accumulator for start-line tokens and header-name
/// matching. Overflow is an error for tokens that must parse and a
/// harmless loss of interest for header names.
#[derive(Debug, Default)]
struct TokenBuf {
    buf: [u8; 32],
    len: usize,
    overflowed: bool,
}

impl TokenBuf {
    fn push(&mut self, b: u8) -> Result<(), ParseError> {
        if self.len >= self.buf.len() {
            return Err(ParseError::TokenTooLong);
        }
        self.buf[self.len] = b;
        self.len += 1;
        Ok(())
    }

    fn push_slice(&mut self, s: &[u8]) -> Result<(), ParseError> {
        if self.len + s.len() > self.buf.len() {
            return Err(ParseError::TokenTooLong);
        }
        self.buf[self.len..self.len + s.len()].copy_from_slice(s);
        self.len += s.len();
        Ok(())
    }

    /// Appends, quietly marking the buffer overflowed when full.
    fn accumulate(&mut self, s: &[u8]) {
        let room = self.buf.len() - self.len;
        if s.len() > room {
            self.overflowed = true;
        }
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s[..take]);
        self.len += take;
    }

    fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    fn len(&self) -> usize {
        self.len
    }

    fn overflowed(&self) -> bool {
        self.overflowed
    }

    fn clear(&mut self) {
        self.len = 0;
        self.overflowed = false;
    }
}

/// Headers whose values drive body framing.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ValueInterest {
    None,
    ContentLength,
    TransferEncoding,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum State {
    /// Between messages; skips CRLF separating pipelined messages.
    Start,
    /// Deciding request vs response by matching against "HTTP/".
    Sniff,
    ReqMethod,
    ReqUrl,
    ReqVersion,
    RespVersion,
    RespStatus,
    RespReason,
    StartLineLf,
    HeaderBegin,
    HeaderName,
    HeaderValueSp,
    HeaderValue,
    HeaderLf,
    HeadersEndLf,
    BodyLen,
    BodyEof,
    ChunkSize,
    ChunkExt,
    ChunkSizeLf,
    ChunkData,
    ChunkDataCr,
    ChunkDataLf,
    TrailerBegin,
    TrailerLine,
    TrailerLf,
    TrailerEndLf,
}

#[derive(Debug)]
pub(crate) struct HttpStream {
    state: State,
    started: bool,
    kind: MessageKind,
    major: u8,
    minor: u8,
    method: Option<Method>,
    status_code: u16,
    content_length: Option<u64>,
    chunked: bool,
    body_remaining: u64,
    chunk_remaining: u64,
    chunk_has_digits: bool,
    interest: ValueInterest,
    token: TokenBuf,
    value_probe: TokenBuf,
}

impl Default for HttpStream {
    fn default() -> Self {
        HttpStream {
            state: State::Start,
            started: false,
            kind: MessageKind::Request,
            major: 0,
            minor: 0,
            method: None,
            status_code: 0,
            content_length: None,
            chunked: false,
            body_remaining: 0,
            chunk_remaining: 0,
            chunk_has_digits: false,
            interest: ValueInterest::None,
            token: TokenBuf::default(),
            value_probe: TokenBuf::default(),
        }
    }
}

impl HttpStream {
    /// `true` once any byte has been consumed in this direction.
    pub(crate) fn started(&self) -> bool {
        self.started
    }

    /// Drops all state, as if no bytes had been seen.
    pub(crate) fn reset(&mut self) {
        *self = HttpStream::default();
    }

    /// Start-line identity of the message currently being parsed. Valid
    /// from the end of the start line until the message completes.
    pub(crate) fn message_info(&self) -> MessageInfo {
        MessageInfo {
            version_major: self.major,
            version_minor: self.minor,
            kind: self.kind,
            method_or_status: match self.kind {
                MessageKind::Request => {
                    MethodOrStatus::Method(self.method.unwrap_or(Method::Get))
                }
                MessageKind::Response => MethodOrStatus::Status(self.status_code),
            },
        }
    }

    fn reset_message(&mut self) {
        self.major = 0;
        self.minor = 0;
        self.method = None;
        self.status_code = 0;
        self.content_length = None;
        self.chunked = false;
        self.body_remaining = 0;
        self.chunk_remaining = 0;
        self.chunk_has_digits = false;
        self.interest = ValueInterest::None;
        self.token.clear();
        self.value_probe.clear();
    }

    fn begin_header_value(&mut self) {
        self.interest = if self.token.overflowed() {
            ValueInterest::None
        } else if self.token.as_slice().eq_ignore_ascii_case(b"content-length") {
            ValueInterest::ContentLength
        } else if self
            .token
            .as_slice()
            .eq_ignore_ascii_case(b"transfer-encoding")
        {
            ValueInterest::TransferEncoding
        } else {
            ValueInterest::None
        };
        self.token.clear();
        self.value_probe.clear();
    }

    fn finish_header_value(&mut self) -> Result<(), ParseError> {
        match self.interest {
            ValueInterest::ContentLength => {
                if self.value_probe.overflowed() {
                    return Err(ParseError::BadContentLength);
                }
                let digits = trim_spaces(self.value_probe.as_slice());
                if digits.is_empty() {
                    return Err(ParseError::BadContentLength);
                }
                let mut value: u64 = 0;
                for &b in digits {
                    if !b.is_ascii_digit() {
                        return Err(ParseError::BadContentLength);
                    }
                    value = value
                        .checked_mul(10)
                        .and_then(|v| v.checked_add((b - b'0') as u64))
                        .ok_or(ParseError::BadContentLength)?;
                }
                self.content_length = Some(value);
            }
            ValueInterest::TransferEncoding => {
                if contains_chunked(self.value_probe.as_slice()) {
                    self.chunked = true;
                }
            }
            ValueInterest::None => {}
        }
        self.interest = ValueInterest::None;
        Ok(())
    }

    fn parse_request_version(&mut self) -> Result<(), ParseError> {
        let t = self.token.as_slice();
        if t.len() != 8
            || &t[..5] != b"HTTP/"
            || !t[5].is_ascii_digit()
            || t[6] != b'.'
            || !t[7].is_ascii_digit()
        {
            return Err(ParseError::BadVersion);
        }
        self.major = t[5] - b'0';
        self.minor = t[7] - b'0';
        Ok(())
    }

    fn parse_response_version(&mut self) -> Result<(), ParseError> {
        let t = self.token.as_slice();
        if t.len() != 3 || !t[0].is_ascii_digit() || t[1] != b'.' || !t[2].is_ascii_digit() {
            return Err(ParseError::BadVersion);
        }
        self.major = t[0] - b'0';
        self.minor = t[2] - b'0';
        Ok(())
    }

    /// Consumes `input`, returning the spans it contained. On error the
    /// stream is left mid-state; callers decide whether to reset.
    pub(crate) fn advance<'a>(
        &mut self,
        input: &'a [u8],
    ) -> Result<Vec<SpanEvent<'a>>, ParseError> {
        let mut events = Vec::new();
        let mut pos = 0usize;
        if !input.is_empty() {
            self.started = true;
        }
        while pos < input.len() {
            match self.state {
                State::Start => match input[pos] {
                    b'\r' | b'\n' => pos += 1,
                    _ => {
                        self.reset_message();
                        self.state = State::Sniff;
                    }
                },
                State::Sniff => {
                    const PREFIX: &[u8] = b"HTTP/";
                    let b = input[pos];
                    if self.token.len() < PREFIX.len() && b == PREFIX[self.token.len()] {
                        self.token.push(b)?;
                        pos += 1;
                        if self.token.len() == PREFIX.len() {
                            self.kind = MessageKind::Response;
                            self.token.clear();
                            self.state = State::RespVersion;
                        }
                    } else {
                        // Bytes matched so far are the start of a method
                        // token; keep them and reparse as a request.
                        self.kind = MessageKind::Request;
                        self.state = State::ReqMethod;
                    }
                }
                State::ReqMethod => {
                    let b = input[pos];
                    if b == b' ' {
                        let token = str::from_utf8(self.token.as_slice())
                            .map_err(|_| ParseError::BadMethod)?;
                        self.method =
                            Some(Method::from_str(token).map_err(|_| ParseError::BadMethod)?);
                        self.token.clear();
                        pos += 1;
                        self.state = State::ReqUrl;
                    } else if b.is_ascii_uppercase() {
                        self.token.push(b).map_err(|_| ParseError::BadMethod)?;
                        pos += 1;
                    } else {
                        return Err(ParseError::BadMethod);
                    }
                }
                State::ReqUrl => match memchr2(b' ', b'\r', &input[pos..]) {
                    Some(rel) if input[pos + rel] == b' ' => {
                        events.push(SpanEvent {
                            kind: SpanKind::Url,
                            data: &input[pos..pos + rel],
                            complete: true,
                        });
                        pos += rel + 1;
                        self.state = State::ReqVersion;
                    }
                    Some(_) => return Err(ParseError::BadRequestLine),
                    None => {
                        events.push(SpanEvent {
                            kind: SpanKind::Url,
                            data: &input[pos..],
                            complete: false,
                        });
                        pos = input.len();
                    }
                },
                State::ReqVersion => match memchr(b'\r', &input[pos..]) {
                    Some(rel) => {
                        self.token
                            .push_slice(&input[pos..pos + rel])
                            .map_err(|_| ParseError::BadVersion)?;
                        self.parse_request_version()?;
                        self.token.clear();
                        pos += rel + 1;
                        self.state = State::StartLineLf;
                    }
                    None => {
                        self.token
                            .push_slice(&input[pos..])
                            .map_err(|_| ParseError::BadVersion)?;
                        pos = input.len();
                    }
                },
                State::RespVersion => {
                    let b = input[pos];
                    if b == b' ' {
                        self.parse_response_version()?;
                        self.token.clear();
                        pos += 1;
                        self.state = State::RespStatus;
                    } else {
                        self.token.push(b).map_err(|_| ParseError::BadVersion)?;
                        pos += 1;
                    }
                }
                State::RespStatus => {
                    let b = input[pos];
                    if b.is_ascii_digit() {
                        if self.token.len() >= 3 {
                            return Err(ParseError::BadStatus);
                        }
                        self.token.push(b)?;
                        pos += 1;
                    } else if b == b' ' || b == b'\r' {
                        let t = self.token.as_slice();
                        if t.len() != 3 {
                            return Err(ParseError::BadStatus);
                        }
                        self.status_code = (t[0] - b'0') as u16 * 100
                            + (t[1] - b'0') as u16 * 10
                            + (t[2] - b'0') as u16;
                        self.token.clear();
                        if b == b' ' {
                            pos += 1;
                        }
                        self.state = State::RespReason;
                    } else {
                        return Err(ParseError::BadStatus);
                    }
                }
                State::RespReason => match memchr(b'\r', &input[pos..]) {
                    Some(rel) => {
                        pos += rel + 1;
                        self.state = State::StartLineLf;
                    }
                    None => pos = input.len(),
                },
                State::StartLineLf => {
                    if input[pos] != b'\n' {
                        return Err(ParseError::BadLineEnd);
                    }
                    pos += 1;
                    self.state = State::HeaderBegin;
                }
                State::HeaderBegin => {
                    if input[pos] == b'\r' {
                        pos += 1;
                        self.state = State::HeadersEndLf;
                    } else {
                        self.token.clear();
                        self.state = State::HeaderName;
                    }
                }
                State::HeaderName => match memchr2(b':', b'\r', &input[pos..]) {
                    Some(rel) if input[pos + rel] == b':' => {
                        let span = &input[pos..pos + rel];
                        self.token.accumulate(span);
                        events.push(SpanEvent {
                            kind: SpanKind::HeaderName,
                            data: span,
                            complete: true,
                        });
                        self.begin_header_value();
                        pos += rel + 1;
                        self.state = State::HeaderValueSp;
                    }
                    Some(_) => return Err(ParseError::BadHeader),
                    None => {
                        let span = &input[pos..];
                        self.token.accumulate(span);
                        events.push(SpanEvent {
                            kind: SpanKind::HeaderName,
                            data: span,
                            complete: false,
                        });
                        pos = input.len();
                    }
                },
                State::HeaderValueSp => match input[pos] {
                    b' ' | b'\t' => pos += 1,
                    _ => self.state = State::HeaderValue,
                },
                State::HeaderValue => match memchr(b'\r', &input[pos..]) {
                    Some(rel) => {
                        let span = &input[pos..pos + rel];
                        self.value_probe.accumulate(span);
                        self.finish_header_value()?;
                        events.push(SpanEvent {
                            kind: SpanKind::HeaderValue,
                            data: span,
                            complete: true,
                        });
                        pos += rel + 1;
                        self.state = State::HeaderLf;
                    }
                    None => {
                        let span = &input[pos..];
                        self.value_probe.accumulate(span);
                        events.push(SpanEvent {
                            kind: SpanKind::HeaderValue,
                            data: span,
                            complete: false,
                        });
                        pos = input.len();
                    }
                },
                State::HeaderLf => {
                    if input[pos] != b'\n' {
                        return Err(ParseError::BadLineEnd);
                    }
                    pos += 1;
                    self.state = State::HeaderBegin;
                }
                State::HeadersEndLf => {
                    if input[pos] != b'\n' {
                        return Err(ParseError::BadLineEnd);
                    }
                    pos += 1;
                    if self.chunked {
                        self.chunk_remaining = 0;
                        self.chunk_has_digits = false;
                        self.state = State::ChunkSize;
                    } else if let Some(length) = self.content_length {
                        if length == 0 {
                            events.push(message_end());
                            self.state = State::Start;
                        } else {
                            self.body_remaining = length;
                            self.state = State::BodyLen;
                        }
                    } else if self.kind == MessageKind::Request {
                        // A request without body framing has no body.
                        events.push(message_end());
                        self.state = State::Start;
                    } else {
                        self.state = State::BodyEof;
                    }
                }
                State::BodyLen => {
                    let avail = input.len() - pos;
                    let take = self.body_remaining.min(avail as u64) as usize;
                    let done = take as u64 == self.body_remaining;
                    events.push(SpanEvent {
                        kind: SpanKind::Body,
                        data: &input[pos..pos + take],
                        complete: done,
                    });
                    self.body_remaining -= take as u64;
                    pos += take;
                    if done {
                        events.push(message_end());
                        self.state = State::Start;
                    }
                }
                State::BodyEof => {
                    events.push(SpanEvent {
                        kind: SpanKind::Body,
                        data: &input[pos..],
                        complete: false,
                    });
                    pos = input.len();
                }
                State::ChunkSize => {
                    let b = input[pos];
                    if let Some(digit) = hex_digit(b) {
                        self.chunk_remaining = self
                            .chunk_remaining
                            .checked_mul(16)
                            .and_then(|v| v.checked_add(digit as u64))
                            .ok_or(ParseError::BadChunkSize)?;
                        self.chunk_has_digits = true;
                        pos += 1;
                    } else if b == b';' {
                        pos += 1;
                        self.state = State::ChunkExt;
                    } else if b == b'\r' {
                        if !self.chunk_has_digits {
                            return Err(ParseError::BadChunkSize);
                        }
                        pos += 1;
                        self.state = State::ChunkSizeLf;
                    } else {
                        return Err(ParseError::BadChunkSize);
                    }
                }
                State::ChunkExt => match memchr(b'\r', &input[pos..]) {
                    Some(rel) => {
                        if !self.chunk_has_digits {
                            return Err(ParseError::BadChunkSize);
                        }
                        pos += rel + 1;
                        self.state = State::ChunkSizeLf;
                    }
                    None => pos = input.len(),
                },
                State::ChunkSizeLf => {
                    if input[pos] != b'\n' {
                        return Err(ParseError::BadLineEnd);
                    }
                    pos += 1;
                    if self.chunk_remaining == 0 {
                        self.state = State::TrailerBegin;
                    } else {
                        self.state = State::ChunkData;
                    }
                }
                State::ChunkData => {
                    let avail = input.len() - pos;
                    let take = self.chunk_remaining.min(avail as u64) as usize;
                    let done = take as u64 == self.chunk_remaining;
                    events.push(SpanEvent {
                        kind: SpanKind::Body,
                        data: &input[pos..pos + take],
                        complete: done,
                    });
                    self.chunk_remaining -= take as u64;
                    pos += take;
                    if done {
                        self.state = State::ChunkDataCr;
                    }
                }
                State::ChunkDataCr => {
                    if input[pos] != b'\r' {
                        return Err(ParseError::BadLineEnd);
                    }
                    pos += 1;
                    self.state = State::ChunkDataLf;
                }
                State::ChunkDataLf => {
                    if input[pos] != b'\n' {
                        return Err(ParseError::BadLineEnd);
                    }
                    pos += 1;
                    self.chunk_remaining = 0;
                    self.chunk_has_digits = false;
                    self.state = State::ChunkSize;
                }
                State::TrailerBegin => {
                    if input[pos] == b'\r' {
                        pos += 1;
                        self.state = State::TrailerEndLf;
                    } else {
                        self.state = State::TrailerLine;
                    }
                }
                State::TrailerLine => match memchr(b'\r', &input[pos..]) {
                    Some(rel) => {
                        pos += rel + 1;
                        self.state = State::TrailerLf;
                    }
                    None => pos = input.len(),
                },
                State::TrailerLf => {
                    if input[pos] != b'\n' {
                        return Err(ParseError::BadLineEnd);
                    }
                    pos += 1;
                    self.state = State::TrailerBegin;
                }
                State::TrailerEndLf => {
                    if input[pos] != b'\n' {
                        return Err(ParseError::BadLineEnd);
                    }
                    pos += 1;
                    events.push(message_end());
                    self.state = State::Start;
                }
            }
        }
        Ok(events)
    }
}

fn message_end() -> SpanEvent<'static> {
    SpanEvent {
        kind: SpanKind::MessageEnd,
        data: &[],
        complete: true,
    }
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn trim_spaces(s: &[u8]) -> &[u8] {
    let start = s.iter().position(|b| *b != b' ' && *b != b'\t');
    match start {
        Some(start) => {
            let end = s.iter().rposition(|b| *b != b' ' && *b != b'\t').map_or(0, |e| e + 1);
            &s[start..end]
        }
        None => &[],
    }
}

fn contains_chunked(s: &[u8]) -> bool {
    s.windows(7).any(|w| w.eq_ignore_ascii_case(b"chunked"))
}
