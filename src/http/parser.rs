//! Incremental HTTP/1.1 parser (spec.md §4.1).
//!
//! One `Parser` handles exactly one message type (request or response) but
//! can be `reset()` and reused across many messages on the same keep-alive
//! connection. Bytes are fed in through `parse()`, which is safe to call
//! with arbitrarily small (even mid-header, mid-chunk) slices.

use crate::error::{Error, Result};
use bitflags::bitflags;

/// Which direction of message this parser instance decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserType {
    Request,
    Response,
}

/// UPnP only ever needs this small set of methods; anything else decodes
/// to `Unknown` rather than failing the parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Notify,
    Search,
    Subscribe,
    Unsubscribe,
    Get,
    Head,
    Post,
    Unknown,
}

impl Method {
    fn from_token(token: &str) -> Method {
        match token {
            "NOTIFY" => Method::Notify,
            "M-SEARCH" => Method::Search,
            "SUBSCRIBE" => Method::Subscribe,
            "UNSUBSCRIBE" => Method::Unsubscribe,
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Notify => "NOTIFY",
            Method::Search => "M-SEARCH",
            Method::Subscribe => "SUBSCRIBE",
            Method::Unsubscribe => "UNSUBSCRIBE",
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Unknown => "UNKNOWN",
        }
    }
}

bitflags! {
    /// Framing flags discovered while parsing headers (spec.md §4.1).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u32 {
        const CHUNKED            = 1 << 0;
        const KEEP_ALIVE         = 1 << 1;
        const CONNECTION_CLOSE   = 1 << 2;
        const CONNECTION_UPGRADE = 1 << 3;
        const TRAILING           = 1 << 4;
        const UPGRADE            = 1 << 5;
        const SKIP_BODY          = 1 << 6;
        const CONTENT_LENGTH     = 1 << 7;
    }
}

#[derive(Debug, Clone)]
pub struct Header {
    pub field: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub start: u64,
    pub end: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    StartLine,
    Headers,
    BodyContentLength,
    BodyChunkSize,
    BodyChunkData,
    BodyChunkCrlf,
    BodyChunkTrailer,
    BodyUntilClose,
    Done,
}

/// Incremental request/response parser.
///
/// `on_headers_complete`, `on_body_chunk` and `on_message_complete` are
/// plain callback slots (not trait objects with lifetimes) so a parser can
/// be stored and driven from an event loop without fighting the borrow
/// checker; set them once after construction.
pub struct Parser {
    kind: ParserType,
    state: State,
    buf: Vec<u8>,

    method: Method,
    url: String,
    status: u16,

    headers: Vec<Header>,
    flags: Flags,
    content_length: u64,
    remaining: u64,
    body: Vec<u8>,
    completed: bool,

    on_headers_complete: Option<Box<dyn FnMut() + Send>>,
    on_body_chunk: Option<Box<dyn FnMut(&[u8]) + Send>>,
    on_message_complete: Option<Box<dyn FnMut() + Send>>,
}

impl Parser {
    pub fn new(kind: ParserType) -> Self {
        Self {
            kind,
            state: State::StartLine,
            buf: Vec::new(),
            method: Method::Unknown,
            url: String::new(),
            status: 0,
            headers: Vec::new(),
            flags: Flags::empty(),
            content_length: 0,
            remaining: 0,
            body: Vec::new(),
            completed: false,
            on_headers_complete: None,
            on_body_chunk: None,
            on_message_complete: None,
        }
    }

    pub fn reset(&mut self) {
        self.state = State::StartLine;
        self.buf.clear();
        self.method = Method::Unknown;
        self.url.clear();
        self.status = 0;
        self.headers.clear();
        self.flags = Flags::empty();
        self.content_length = 0;
        self.remaining = 0;
        self.body.clear();
        self.completed = false;
    }

    pub fn set_headers_complete_callback(&mut self, cb: impl FnMut() + Send + 'static) {
        self.on_headers_complete = Some(Box::new(cb));
    }

    pub fn set_body_chunk_callback(&mut self, cb: impl FnMut(&[u8]) + Send + 'static) {
        self.on_body_chunk = Some(Box::new(cb));
    }

    pub fn set_message_complete_callback(&mut self, cb: impl FnMut() + Send + 'static) {
        self.on_message_complete = Some(Box::new(cb));
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Case-insensitive header lookup.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.field.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    /// Moves the accumulated body out, leaving an empty buffer behind.
    pub fn steal_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }

    /// Feeds `data` into the parser. Always consumes the whole slice on
    /// success (the parser buffers any trailing partial state internally);
    /// on a framing error the parse call fails and the parser must be
    /// `reset()` before it can be used again.
    pub fn parse(&mut self, data: &[u8]) -> Result<usize> {
        self.buf.extend_from_slice(data);
        self.drive()?;
        Ok(data.len())
    }

    fn drive(&mut self) -> Result<()> {
        loop {
            match self.state {
                State::StartLine => {
                    let Some(line) = take_line(&mut self.buf) else {
                        return Ok(());
                    };
                    self.parse_start_line(&line)?;
                    self.state = State::Headers;
                }
                State::Headers => {
                    let Some(line) = take_line(&mut self.buf) else {
                        return Ok(());
                    };
                    if line.is_empty() {
                        self.finish_headers()?;
                    } else {
                        self.parse_header_line(&line)?;
                    }
                }
                State::BodyContentLength => {
                    if self.remaining == 0 {
                        self.finish_message();
                        continue;
                    }
                    if self.buf.is_empty() {
                        return Ok(());
                    }
                    let take = (self.remaining as usize).min(self.buf.len());
                    let chunk: Vec<u8> = self.buf.drain(..take).collect();
                    self.remaining -= take as u64;
                    self.emit_body_chunk(&chunk);
                    if self.remaining == 0 {
                        self.finish_message();
                    }
                }
                State::BodyChunkSize => {
                    let Some(line) = take_line(&mut self.buf) else {
                        return Ok(());
                    };
                    let size_part = line.split(';').next().unwrap_or("").trim();
                    let size = u64::from_str_radix(size_part, 16).map_err(|_| {
                        Error::MalformedBody(format!("invalid chunk size {size_part:?}"))
                    })?;
                    if size == 0 {
                        self.flags.insert(Flags::TRAILING);
                        self.state = State::BodyChunkTrailer;
                    } else {
                        self.remaining = size;
                        self.state = State::BodyChunkData;
                    }
                }
                State::BodyChunkData => {
                    if self.buf.is_empty() {
                        return Ok(());
                    }
                    let take = (self.remaining as usize).min(self.buf.len());
                    let chunk: Vec<u8> = self.buf.drain(..take).collect();
                    self.remaining -= take as u64;
                    self.emit_body_chunk(&chunk);
                    if self.remaining == 0 {
                        self.state = State::BodyChunkCrlf;
                    }
                }
                State::BodyChunkCrlf => {
                    let Some(_line) = take_line(&mut self.buf) else {
                        return Ok(());
                    };
                    self.state = State::BodyChunkSize;
                }
                State::BodyChunkTrailer => {
                    let Some(line) = take_line(&mut self.buf) else {
                        return Ok(());
                    };
                    if line.is_empty() {
                        self.finish_message();
                    } else {
                        self.parse_header_line(&line)?;
                    }
                }
                State::BodyUntilClose => {
                    if !self.buf.is_empty() {
                        let chunk = std::mem::take(&mut self.buf);
                        self.emit_body_chunk(&chunk);
                    }
                    return Ok(());
                }
                State::Done => return Ok(()),
            }
        }
    }

    fn parse_start_line(&mut self, line: &str) -> Result<()> {
        match self.kind {
            ParserType::Request => {
                let mut parts = line.splitn(3, ' ');
                let method = parts
                    .next()
                    .ok_or_else(|| Error::MalformedHeader("empty request line".into()))?;
                let url = parts
                    .next()
                    .ok_or_else(|| Error::MalformedHeader("missing request target".into()))?;
                let _version = parts.next();
                self.method = Method::from_token(method);
                self.url = url.to_string();
            }
            ParserType::Response => {
                let mut parts = line.splitn(3, ' ');
                let _version = parts
                    .next()
                    .ok_or_else(|| Error::MalformedHeader("empty status line".into()))?;
                let code = parts
                    .next()
                    .ok_or_else(|| Error::MalformedHeader("missing status code".into()))?;
                self.status = code
                    .parse()
                    .map_err(|_| Error::MalformedHeader(format!("bad status code {code:?}")))?;
            }
        }
        Ok(())
    }

    fn parse_header_line(&mut self, line: &str) -> Result<()> {
        let (field, value) = line
            .split_once(':')
            .ok_or_else(|| Error::MalformedHeader(format!("no colon in header {line:?}")))?;
        let field = field.trim().to_string();
        let value = value.trim().to_string();

        if field.eq_ignore_ascii_case("Transfer-Encoding") && value.eq_ignore_ascii_case("chunked")
        {
            self.flags.insert(Flags::CHUNKED);
        } else if field.eq_ignore_ascii_case("Content-Length") {
            self.content_length = value
                .parse()
                .map_err(|_| Error::MalformedHeader(format!("bad content-length {value:?}")))?;
            self.flags.insert(Flags::CONTENT_LENGTH);
        } else if field.eq_ignore_ascii_case("Connection") {
            for token in value.split(',') {
                let token = token.trim();
                if token.eq_ignore_ascii_case("close") {
                    self.flags.insert(Flags::CONNECTION_CLOSE);
                } else if token.eq_ignore_ascii_case("keep-alive") {
                    self.flags.insert(Flags::KEEP_ALIVE);
                } else if token.eq_ignore_ascii_case("upgrade") {
                    self.flags.insert(Flags::CONNECTION_UPGRADE);
                }
            }
        } else if field.eq_ignore_ascii_case("Upgrade") {
            self.flags.insert(Flags::UPGRADE);
        }

        self.headers.push(Header { field, value });
        Ok(())
    }

    fn finish_headers(&mut self) -> Result<()> {
        if !self.flags.contains(Flags::CONNECTION_CLOSE) && !self.flags.contains(Flags::KEEP_ALIVE)
        {
            // HTTP/1.1 defaults to persistent connections.
            self.flags.insert(Flags::KEEP_ALIVE);
        }

        if let Some(cb) = self.on_headers_complete.as_mut() {
            cb();
        }

        if self.method == Method::Head || self.status / 100 == 1 || self.status == 204 || self.status == 304
        {
            self.flags.insert(Flags::SKIP_BODY);
            self.finish_message();
            return Ok(());
        }

        if self.flags.contains(Flags::CHUNKED) {
            self.state = State::BodyChunkSize;
        } else if self.flags.contains(Flags::CONTENT_LENGTH) {
            self.remaining = self.content_length;
            self.state = State::BodyContentLength;
        } else if self.kind == ParserType::Response && self.flags.contains(Flags::CONNECTION_CLOSE)
        {
            self.state = State::BodyUntilClose;
        } else {
            // No body framing information: treat as a zero-length body.
            self.finish_message();
        }
        Ok(())
    }

    fn emit_body_chunk(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
        if let Some(cb) = self.on_body_chunk.as_mut() {
            cb(chunk);
        }
    }

    fn finish_message(&mut self) {
        self.completed = true;
        self.state = State::Done;
        if let Some(cb) = self.on_message_complete.as_mut() {
            cb();
        }
    }

    /// Marks end-of-stream for a response framed by connection-close: the
    /// socket is gone, so whatever body has accumulated is final.
    pub fn notify_eof(&mut self) {
        if self.state == State::BodyUntilClose {
            self.finish_message();
        }
    }

    /// Parses a `Range: bytes=<start>-<end>` (or open-ended `bytes=<start>-`)
    /// header value.
    pub fn parse_range(s: &str) -> Result<Range> {
        let s = s.trim();
        let rest = s
            .strip_prefix("bytes=")
            .ok_or_else(|| Error::MalformedHeader(format!("not a byte-range: {s:?}")))?;
        let (start, end) = rest
            .split_once('-')
            .ok_or_else(|| Error::MalformedHeader(format!("malformed range: {s:?}")))?;
        let start: u64 = start
            .trim()
            .parse()
            .map_err(|_| Error::MalformedHeader(format!("malformed range start: {s:?}")))?;
        let end = end.trim();
        let end = if end.is_empty() {
            None
        } else {
            Some(
                end.parse()
                    .map_err(|_| Error::MalformedHeader(format!("malformed range end: {s:?}")))?,
            )
        };
        Ok(Range { start, end })
    }
}

/// Pulls one CRLF- (or bare-LF-) terminated line out of `buf`, returning
/// `None` if no full line is buffered yet.
fn take_line(buf: &mut Vec<u8>) -> Option<String> {
    let pos = buf.iter().position(|&b| b == b'\n')?;
    let mut line: Vec<u8> = buf.drain(..=pos).collect();
    line.pop(); // '\n'
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Some(String::from_utf8_lossy(&line).into_owned())
}
