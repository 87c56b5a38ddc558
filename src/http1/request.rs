/*
 * Copyright (C) 2026 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::core::buffer::ReadBuffer;
use crate::http1::cookie::{is_token_char, parse_cookies, Cookie};
use crate::http1::headers::{header_contains_param, HeaderList};
use crate::net::{is_timeout, Socket};
use log::debug;
use std::cmp;
use std::io::{self, BufReader, Read};
use std::ops::Range;
use std::str;

const TRAILERS_MAX: usize = 32;

pub const CONTINUE_RESPONSE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Version {
    Http09,
    Http10,
    #[default]
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http09 => "HTTP/0.9",
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("bad request line")]
    BadRequestLine,

    #[error("bad header")]
    BadHeader,

    #[error("request header too large")]
    HeaderTooLarge,

    #[error("invalid content length")]
    InvalidContentLength,

    #[error("unsupported transfer encoding")]
    UnsupportedTransferEncoding,

    #[error("bad chunk")]
    BadChunk,
}

impl RequestError {
    // status for the error page, if one should be sent
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Io(_) => None,
            Self::BadRequestLine
            | Self::BadHeader
            | Self::InvalidContentLength
            | Self::BadChunk => Some(400),
            Self::HeaderTooLarge => Some(431),
            Self::UnsupportedTransferEncoding => Some(501),
        }
    }

    // classifies an error raised while reading a body
    pub fn from_body(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::InvalidData {
            Self::BadChunk
        } else {
            Self::Io(e)
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error("body already opened as a byte stream")]
    StreamInUse,

    #[error("body already opened as a reader")]
    ReaderInUse,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Parsed identity of one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    pub method: String,
    pub raw_uri: String,
    pub host: Option<String>,
    pub path: String,
    pub path_components: Vec<String>,
    pub query: Option<String>,
    pub version: Version,
    pub content_length: Option<u64>,
    pub expect_100: bool,
    pub connection_close: bool,
    pub chunked: bool,
}

impl Invocation {
    fn clear(&mut self) {
        self.method.clear();
        self.raw_uri.clear();
        self.host = None;
        self.path.clear();
        self.path_components.clear();
        self.query = None;
        self.version = Version::Http11;
        self.content_length = None;
        self.expect_100 = false;
        self.connection_close = false;
        self.chunked = false;
    }

    pub fn is_head(&self) -> bool {
        self.method == "HEAD"
    }

    pub fn query_pairs(&self) -> Vec<(String, String)> {
        match &self.query {
            Some(q) => url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect(),
            None => Vec::new(),
        }
    }

    // true if the request can be followed by another on the same connection
    pub fn allows_keepalive(&self) -> bool {
        self.version >= Version::Http11 && !self.connection_close
    }
}

fn find_byte(haystack: &[u8], needle: u8) -> Option<usize> {
    haystack.iter().position(|b| *b == needle)
}

// position just past the blank line ending a header block that starts at
// `from`, accepting bare LF line endings
fn find_head_end(buf: &[u8], from: usize) -> Option<usize> {
    let mut pos = from;

    loop {
        match buf.get(pos) {
            Some(b'\n') => return Some(pos + 1),
            Some(b'\r') if buf.get(pos + 1) == Some(&b'\n') => return Some(pos + 2),
            Some(_) => {}
            None => return None,
        }

        // not a blank line. skip to the next line
        let nl = find_byte(&buf[pos..], b'\n')?;
        pos += nl + 1;
    }
}

fn trim_end(mut s: &[u8]) -> &[u8] {
    while let Some((last, rest)) = s.split_last() {
        if *last > b' ' {
            break;
        }

        s = rest;
    }

    s
}

fn trim_start(mut s: &[u8]) -> &[u8] {
    while let Some((first, rest)) = s.split_first() {
        if *first != b' ' && *first != b'\t' {
            break;
        }

        s = rest;
    }

    s
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

// %xx decoding. malformed escapes are kept as-is
fn percent_decode(src: &[u8]) -> String {
    let mut out = Vec::with_capacity(src.len());
    let mut i = 0;

    while i < src.len() {
        if src[i] == b'%' && i + 2 < src.len() {
            if let (Some(h), Some(l)) = (hex_value(src[i + 1]), hex_value(src[i + 2])) {
                out.push(h << 4 | l);
                i += 3;
                continue;
            }
        }

        out.push(src[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn parse_version(protocol: &[u8]) -> Option<Version> {
    match protocol {
        b"" => Some(Version::Http09),
        b"HTTP/1.1" => Some(Version::Http11),
        b"HTTP/1.0" => Some(Version::Http10),
        _ => None,
    }
}

fn parse_request_line(line: &[u8], inv: &mut Invocation) -> Result<(), RequestError> {
    let line = trim_end(line);

    let method_end = line
        .iter()
        .position(|b| *b == b' ' || *b == b'\t')
        .unwrap_or(line.len());

    let method = &line[..method_end];
    if method.is_empty() || !method.iter().all(|c| is_token_char(*c)) {
        return Err(RequestError::BadRequestLine);
    }

    let rest = trim_start(&line[method_end..]);

    let uri_end = rest
        .iter()
        .position(|b| *b == b' ' || *b == b'\t')
        .unwrap_or(rest.len());

    let uri = &rest[..uri_end];
    if uri.is_empty() {
        return Err(RequestError::BadRequestLine);
    }

    let protocol = trim_start(&rest[uri_end..]);

    inv.version = match parse_version(protocol) {
        Some(v) => v,
        None => return Err(RequestError::BadRequestLine),
    };

    let uri_str = match str::from_utf8(uri) {
        Ok(s) => s,
        Err(_) => return Err(RequestError::BadRequestLine),
    };

    inv.method = String::from_utf8_lossy(method).to_ascii_uppercase();
    inv.raw_uri = uri_str.to_string();

    let mut target = uri_str;

    // absolute-form
    for scheme in ["http://", "https://"] {
        if target.len() >= scheme.len() && target[..scheme.len()].eq_ignore_ascii_case(scheme) {
            let after = &target[scheme.len()..];

            let (host, path) = match after.find('/') {
                Some(pos) => (&after[..pos], &after[pos..]),
                None => (after, "/"),
            };

            if !host.is_empty() {
                inv.host = Some(host.to_string());
            }

            target = path;
            break;
        }
    }

    let (path, query) = match target.find('?') {
        Some(pos) => (&target[..pos], Some(&target[(pos + 1)..])),
        None => (target, None),
    };

    inv.path = percent_decode(path.as_bytes());
    inv.query = query.map(|q| q.to_string());

    inv.path_components = inv
        .path
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect();

    Ok(())
}

// unsigned decimal prefix. None if there are no digits
fn parse_content_length(value: &[u8]) -> Result<Option<u64>, RequestError> {
    let mut out: Option<u64> = None;

    for c in value {
        if !c.is_ascii_digit() {
            break;
        }

        let digit = u64::from(c - b'0');
        let acc = out.unwrap_or(0);

        let acc = acc
            .checked_mul(10)
            .and_then(|v| v.checked_add(digit))
            .ok_or(RequestError::InvalidContentLength)?;

        out = Some(acc);
    }

    Ok(out)
}

// fills the buffer once. EOF and a full buffer are errors here since the
// caller needs more bytes to make progress
fn fill(rbuf: &mut ReadBuffer, sock: &mut dyn Socket) -> Result<(), io::Error> {
    if rbuf.is_full() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "chunk framing too large",
        ));
    }

    match rbuf.fill_from(sock)? {
        0 => Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyDecoder {
    Fixed(u64),
    Chunked(ChunkState),
}

impl BodyDecoder {
    fn is_done(&self) -> bool {
        matches!(self, Self::Fixed(0) | Self::Chunked(ChunkState::Done))
    }

    fn read(
        &mut self,
        rbuf: &mut ReadBuffer,
        sock: &mut dyn Socket,
        trailers: &mut HeaderList,
        dest: &mut [u8],
    ) -> Result<usize, io::Error> {
        if dest.is_empty() {
            return Ok(0);
        }

        loop {
            match self {
                Self::Fixed(0) => return Ok(0),
                Self::Fixed(remaining) => {
                    if rbuf.read_avail() == 0 {
                        fill(rbuf, sock)?;
                    }

                    let max = cmp::min(*remaining, dest.len() as u64) as usize;
                    let size = rbuf.take_into(&mut dest[..max]);
                    *remaining -= size as u64;

                    return Ok(size);
                }
                Self::Chunked(state) => match *state {
                    ChunkState::Size => match httparse::parse_chunk_size(rbuf.read_buf()) {
                        Ok(httparse::Status::Complete((consumed, size))) => {
                            rbuf.read_commit(consumed);

                            *state = if size == 0 {
                                ChunkState::Trailers
                            } else {
                                ChunkState::Data(size)
                            };
                        }
                        Ok(httparse::Status::Partial) => fill(rbuf, sock)?,
                        Err(_) => {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "invalid chunk size",
                            ))
                        }
                    },
                    ChunkState::Data(remaining) => {
                        if rbuf.read_avail() == 0 {
                            fill(rbuf, sock)?;
                        }

                        let max = cmp::min(remaining, dest.len() as u64) as usize;
                        let size = rbuf.take_into(&mut dest[..max]);
                        let remaining = remaining - size as u64;

                        *state = if remaining == 0 {
                            ChunkState::DataEnd
                        } else {
                            ChunkState::Data(remaining)
                        };

                        return Ok(size);
                    }
                    ChunkState::DataEnd => {
                        let buf = rbuf.read_buf();

                        if buf.starts_with(b"\r\n") {
                            rbuf.read_commit(2);
                            *state = ChunkState::Size;
                        } else if buf.starts_with(b"\n") {
                            rbuf.read_commit(1);
                            *state = ChunkState::Size;
                        } else if buf.is_empty() || buf == b"\r" {
                            fill(rbuf, sock)?;
                        } else {
                            return Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "missing chunk terminator",
                            ));
                        }
                    }
                    ChunkState::Trailers => {
                        let mut headers = [httparse::EMPTY_HEADER; TRAILERS_MAX];

                        match httparse::parse_headers(rbuf.read_buf(), &mut headers) {
                            Ok(httparse::Status::Complete((consumed, parsed))) => {
                                for h in parsed.iter() {
                                    trailers.add(h.name, &String::from_utf8_lossy(h.value));
                                }

                                rbuf.read_commit(consumed);
                                *state = ChunkState::Done;
                            }
                            Ok(httparse::Status::Partial) => fill(rbuf, sock)?,
                            Err(_) => {
                                return Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    "invalid trailers",
                                ))
                            }
                        }
                    }
                    ChunkState::Done => return Ok(0),
                },
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyMode {
    Unopened,
    Stream,
    Reader,
}

/// Request front-end: request line and header tokenizer, special headers
/// and the gated body.
pub struct RequestReader {
    max_header_size: usize,
    scratch: Vec<u8>,
    headers: Vec<(Range<usize>, Range<usize>)>,
    cookies: Vec<Cookie>,
    trailers: HeaderList,
    invocation: Invocation,
    body: BodyDecoder,
    body_mode: BodyMode,
    continue_pending: bool,
}

impl RequestReader {
    pub fn new(max_header_size: usize) -> Self {
        Self {
            max_header_size,
            scratch: Vec::with_capacity(max_header_size),
            headers: Vec::new(),
            cookies: Vec::new(),
            trailers: HeaderList::new(),
            invocation: Invocation::default(),
            body: BodyDecoder::Fixed(0),
            body_mode: BodyMode::Unopened,
            continue_pending: false,
        }
    }

    pub fn clear(&mut self) {
        self.scratch.clear();
        self.headers.clear();
        self.cookies.clear();
        self.trailers.clear();
        self.invocation.clear();
        self.body = BodyDecoder::Fixed(0);
        self.body_mode = BodyMode::Unopened;
        self.continue_pending = false;
    }

    pub fn invocation(&self) -> &Invocation {
        &self.invocation
    }

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name == name)
    }

    pub fn trailers(&self) -> &HeaderList {
        &self.trailers
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.headers.iter().map(|(k, v)| {
            // keys are token chars, always ascii
            let key = str::from_utf8(&self.scratch[k.clone()]).unwrap_or("");

            (key, &self.scratch[v.clone()])
        })
    }

    pub fn header_bytes(&self, name: &str) -> Option<&[u8]> {
        self.headers()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.header_bytes(name).and_then(|v| str::from_utf8(v).ok())
    }

    pub fn header_count(&self) -> usize {
        self.headers.len()
    }

    /// Reads one request head from `rbuf`, filling it from `sock` as needed.
    ///
    /// Returns `Ok(false)` if the peer closed or went quiet before sending
    /// any request bytes.
    pub fn read_request(
        &mut self,
        rbuf: &mut ReadBuffer,
        sock: &mut dyn Socket,
    ) -> Result<bool, RequestError> {
        self.clear();

        loop {
            // tolerate stray line endings between requests
            let skip = rbuf
                .read_buf()
                .iter()
                .take_while(|b| matches!(**b, b'\r' | b'\n' | b' ' | b'\t'))
                .count();
            rbuf.read_commit(skip);

            let buf = rbuf.read_buf();

            if let Some(line_end) = find_byte(buf, b'\n') {
                parse_request_line(&buf[..line_end], &mut self.invocation)?;

                let head_end = if self.invocation.version == Version::Http09 {
                    Some(line_end + 1)
                } else {
                    find_head_end(buf, line_end + 1)
                };

                if let Some(head_end) = head_end {
                    if head_end > self.max_header_size {
                        return Err(RequestError::HeaderTooLarge);
                    }

                    self.parse_headers(&buf[(line_end + 1)..head_end]);
                    rbuf.read_commit(head_end);

                    self.process_headers()?;

                    return Ok(true);
                }
            }

            if rbuf.read_avail() >= self.max_header_size || rbuf.is_full() {
                return Err(RequestError::HeaderTooLarge);
            }

            let started = rbuf.read_avail() > 0;

            match rbuf.fill_from(sock) {
                Ok(0) if !started => return Ok(false),
                Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(_) => {}
                Err(e) if is_timeout(&e) && !started => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
    }

    // tokenizes header lines into the scratch buffer
    fn parse_headers(&mut self, block: &[u8]) {
        for line in block.split(|b| *b == b'\n') {
            let line = match line.strip_suffix(b"\r") {
                Some(line) => line,
                None => line,
            };

            if line.is_empty() {
                break;
            }

            if line[0] == b' ' || line[0] == b'\t' {
                // continuation. values end the scratch buffer so the last
                // one can be extended in place
                let cont = trim_end(trim_start(line));

                if let Some((_, v)) = self.headers.last_mut() {
                    if !cont.is_empty() {
                        self.scratch.push(b' ');
                        self.scratch.extend_from_slice(cont);
                        v.end = self.scratch.len();
                    }
                } else {
                    debug!("ignoring continuation line without a header");
                }

                continue;
            }

            let colon = match find_byte(line, b':') {
                Some(pos) => pos,
                None => {
                    debug!(
                        "ignoring header line without colon: {}",
                        String::from_utf8_lossy(line).escape_default()
                    );
                    continue;
                }
            };

            let key = trim_end(&line[..colon]);
            let value = trim_end(trim_start(&line[(colon + 1)..]));

            if key.is_empty() || !key.iter().all(|c| is_token_char(*c)) {
                debug!(
                    "ignoring malformed header name: {}",
                    String::from_utf8_lossy(key).escape_default()
                );
                continue;
            }

            let key_start = self.scratch.len();
            self.scratch.extend_from_slice(key);
            let key_range = key_start..self.scratch.len();

            let value_start = self.scratch.len();
            self.scratch.extend_from_slice(value);
            let value_range = value_start..self.scratch.len();

            self.headers.push((key_range, value_range));
        }
    }

    // applies the headers the engine interprets itself
    fn process_headers(&mut self) -> Result<(), RequestError> {
        let mut transfer_encoding = false;
        let mut i = 0;

        while i < self.headers.len() {
            let (k, v) = self.headers[i].clone();
            let key = &self.scratch[k];
            let value = &self.scratch[v];

            if key.eq_ignore_ascii_case(b"Connection") {
                if header_contains_param(value, "close") {
                    self.invocation.connection_close = true;
                }
            } else if key.eq_ignore_ascii_case(b"Cookie") {
                parse_cookies(value, &mut self.cookies);
            } else if key.eq_ignore_ascii_case(b"Content-Length") {
                if let Some(len) = parse_content_length(value)? {
                    self.invocation.content_length = Some(len);
                }
            } else if key.eq_ignore_ascii_case(b"Expect") {
                if value.eq_ignore_ascii_case(b"100-continue") {
                    self.invocation.expect_100 = true;

                    // consumed by the engine
                    self.headers.remove(i);
                    continue;
                }
            } else if key.eq_ignore_ascii_case(b"Host") {
                if self.invocation.host.is_none() {
                    self.invocation.host = Some(String::from_utf8_lossy(value).into_owned());
                }
            } else if key.eq_ignore_ascii_case(b"Transfer-Encoding") {
                transfer_encoding = true;

                let last = value
                    .split(|b| *b == b',')
                    .last()
                    .map(|s| trim_end(trim_start(s)))
                    .unwrap_or(b"");

                if last.eq_ignore_ascii_case(b"chunked") {
                    self.invocation.chunked = true;
                } else if !last.eq_ignore_ascii_case(b"identity") {
                    return Err(RequestError::UnsupportedTransferEncoding);
                }
            }

            i += 1;
        }

        if transfer_encoding && self.invocation.chunked {
            self.body = BodyDecoder::Chunked(ChunkState::Size);
        } else {
            self.body = BodyDecoder::Fixed(self.invocation.content_length.unwrap_or(0));
        }

        self.continue_pending = self.invocation.expect_100;

        Ok(())
    }

    /// Binds the body for this request.
    ///
    /// Returns true if an interim `100 Continue` should be written first.
    /// That happens at most once per request.
    pub fn open_body(&mut self, as_reader: bool) -> Result<bool, BodyError> {
        match (self.body_mode, as_reader) {
            (BodyMode::Reader, false) => return Err(BodyError::ReaderInUse),
            (BodyMode::Stream, true) => return Err(BodyError::StreamInUse),
            (BodyMode::Unopened, false) => self.body_mode = BodyMode::Stream,
            (BodyMode::Unopened, true) => self.body_mode = BodyMode::Reader,
            _ => {}
        }

        let send_continue = self.continue_pending && !self.body.is_done();
        self.continue_pending = false;

        Ok(send_continue)
    }

    // drops a pending interim response, e.g. once the final headers are out
    pub fn cancel_continue(&mut self) {
        self.continue_pending = false;
    }

    pub fn body_stream<'a>(
        &'a mut self,
        rbuf: &'a mut ReadBuffer,
        sock: &'a mut dyn Socket,
    ) -> BodyStream<'a> {
        BodyStream {
            decoder: &mut self.body,
            trailers: &mut self.trailers,
            rbuf,
            sock,
        }
    }

    pub fn is_body_complete(&self) -> bool {
        self.body.is_done()
    }

    /// Discards any unread body so the next request can be parsed.
    ///
    /// Returns false if more than `max` bytes would need to be skipped.
    pub fn skip_body(
        &mut self,
        rbuf: &mut ReadBuffer,
        sock: &mut dyn Socket,
        max: u64,
    ) -> Result<bool, io::Error> {
        if let BodyDecoder::Fixed(remaining) = self.body {
            if remaining > max {
                return Ok(false);
            }
        }

        let mut scratch = [0u8; 1024];
        let mut skipped: u64 = 0;

        while !self.body.is_done() {
            let size = self
                .body
                .read(rbuf, sock, &mut self.trailers, &mut scratch)?;

            if size == 0 {
                break;
            }

            skipped += size as u64;

            if skipped > max {
                return Ok(false);
            }
        }

        Ok(true)
    }
}

/// Byte view of the request body.
pub struct BodyStream<'a> {
    decoder: &'a mut BodyDecoder,
    trailers: &'a mut HeaderList,
    rbuf: &'a mut ReadBuffer,
    sock: &'a mut dyn Socket,
}

impl Read for BodyStream<'_> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, io::Error> {
        self.decoder
            .read(self.rbuf, self.sock, self.trailers, buf)
    }
}

pub type BodyReader<'a> = BufReader<BodyStream<'a>>;
