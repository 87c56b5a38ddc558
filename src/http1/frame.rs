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

use crate::core::buffer::{BufferChain, BufferPool};
use crate::http1::headers::{content_type_charset, header_contains_param, HeaderList};
use crate::http1::request::Version;
use crate::net::{is_client_disconnect, Socket};
use arrayvec::ArrayVec;
use log::{debug, warn};
use std::io::{self, Write};
use std::mem;
use std::str;
use std::sync::Arc;
use time::macros::format_description;
use time::OffsetDateTime;

const CHUNK_END: &[u8] = b"\r\n0\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Latin1,
}

impl Encoding {
    pub fn from_charset(charset: &str) -> Option<Self> {
        let charset = charset.trim();

        if charset.eq_ignore_ascii_case("utf-8") || charset.eq_ignore_ascii_case("utf8") {
            Some(Self::Utf8)
        } else if charset.eq_ignore_ascii_case("iso-8859-1")
            || charset.eq_ignore_ascii_case("latin1")
            || charset.eq_ignore_ascii_case("us-ascii")
        {
            Some(Self::Latin1)
        } else {
            None
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Utf8 => "utf-8",
            Self::Latin1 => "iso-8859-1",
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("response header already written")]
    Committed,
}

pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

// 1xx, 204 and 304 never carry a body
fn status_allows_body(code: u16) -> bool {
    !((100..200).contains(&code) || code == 204 || code == 304)
}

fn has_line_break(s: &str) -> bool {
    s.bytes().any(|c| c == b'\r' || c == b'\n')
}

// a field with a line break would split the message
fn check_field(kind: &str, name: &str, value: &str) -> bool {
    if has_line_break(name) || has_line_break(value) {
        warn!("ignoring {} {:?} containing a line break", kind, name);

        return false;
    }

    true
}

fn write_date<W: Write>(w: &mut W) -> Result<(), io::Error> {
    let format = format_description!(
        "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
    );

    let mut date: ArrayVec<u8, 40> = ArrayVec::new();

    OffsetDateTime::now_utc()
        .format_into(&mut date, &format)
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;

    w.write_all(b"Date: ")?;
    w.write_all(&date)?;
    w.write_all(b"\r\n")
}

/// Response framer for one connection.
///
/// Text goes through a char buffer and bytes through a segment chain. The
/// status line and headers go out on the first flush. Without a declared
/// length, a response that fits the buffers gets a computed
/// `Content-Length`; otherwise HTTP/1.1 responses are chunked and HTTP/1.0
/// responses are delimited by closing the connection.
pub struct FrameWriter {
    pool: Arc<BufferPool>,
    server_header: Option<String>,
    char_buffer_size: usize,
    buffer_capacity: usize,

    chars: String,
    encoded: Vec<u8>,
    head_buf: Vec<u8>,
    chain: BufferChain,

    version: Version,
    head_request: bool,
    status: u16,
    reason: Option<String>,
    headers: HeaderList,
    footers: HeaderList,
    content_type: Option<String>,
    content_length: Option<u64>,
    encoding: Encoding,
    used_print: bool,

    keepalive: bool,
    ignore_disconnect: bool,
    header_written: bool,
    chunked: bool,
    finished: bool,
    closed: bool,
    disconnected: bool,
    body_written: u64,
    length_violated: bool,
    length_violations: u64,
}

impl FrameWriter {
    pub fn new(
        pool: Arc<BufferPool>,
        char_buffer_size: usize,
        response_buffer_size: usize,
        server_header: Option<String>,
    ) -> Self {
        let buffer_capacity = pool.round_up(response_buffer_size);

        Self {
            pool,
            server_header,
            char_buffer_size,
            buffer_capacity,
            chars: String::with_capacity(char_buffer_size),
            encoded: Vec::new(),
            head_buf: Vec::new(),
            chain: BufferChain::new(),
            version: Version::Http11,
            head_request: false,
            status: 200,
            reason: None,
            headers: HeaderList::new(),
            footers: HeaderList::new(),
            content_type: None,
            content_length: None,
            encoding: Encoding::Utf8,
            used_print: false,
            keepalive: true,
            ignore_disconnect: true,
            header_written: false,
            chunked: false,
            finished: false,
            closed: false,
            disconnected: false,
            body_written: 0,
            length_violated: false,
            length_violations: 0,
        }
    }

    // prepares for the response to a new request
    pub fn start(
        &mut self,
        version: Version,
        head_request: bool,
        keepalive: bool,
        ignore_disconnect: bool,
    ) {
        self.chain.clear(&self.pool);
        self.chars.clear();

        self.version = version;
        self.head_request = head_request;
        self.keepalive = keepalive;
        self.ignore_disconnect = ignore_disconnect;

        self.header_written = false;
        self.chunked = false;
        self.finished = false;
        self.closed = false;
        self.disconnected = false;

        self.clear_response();
    }

    fn clear_response(&mut self) {
        self.status = 200;
        self.reason = None;
        self.headers.clear();
        self.footers.clear();
        self.content_type = None;
        self.content_length = None;
        self.encoding = Encoding::Utf8;
        self.used_print = false;
        self.body_written = 0;
        self.length_violated = false;
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, code: u16) {
        if self.header_written {
            debug!("ignoring status {} after the header was written", code);
            return;
        }

        self.status = code;
        self.reason = None;
    }

    pub fn set_status_with_reason(&mut self, code: u16, reason: &str) {
        self.set_status(code);

        if self.header_written {
            return;
        }

        if has_line_break(reason) {
            warn!("ignoring reason phrase containing a line break for status {}", code);
            return;
        }

        self.reason = Some(reason.to_string());
    }

    // interprets headers the framer owns. returns true if consumed
    fn set_special_header(&mut self, name: &str, value: &str) -> bool {
        if name.eq_ignore_ascii_case("Content-Length") {
            match value.trim().parse::<u64>() {
                Ok(len) => self.content_length = Some(len),
                Err(_) => debug!("ignoring invalid content length: {}", value),
            }

            true
        } else if name.eq_ignore_ascii_case("Connection") {
            if header_contains_param(value.as_bytes(), "close") {
                self.keepalive = false;

                true
            } else {
                false
            }
        } else if name.eq_ignore_ascii_case("Transfer-Encoding") {
            // framing is ours
            true
        } else if name.eq_ignore_ascii_case("Content-Type") {
            self.set_content_type(value);

            true
        } else {
            false
        }
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        if self.header_written {
            debug!("ignoring header {} after the header was written", name);
            return;
        }

        if !check_field("header", name, value) {
            return;
        }

        if !self.set_special_header(name, value) {
            self.headers.set(name, value);
        }
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        if self.header_written {
            debug!("ignoring header {} after the header was written", name);
            return;
        }

        if !check_field("header", name, value) {
            return;
        }

        if !self.set_special_header(name, value) {
            self.headers.add(name, value);
        }
    }

    pub fn remove_header(&mut self, name: &str) -> bool {
        !self.header_written && self.headers.remove(name)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn set_content_type(&mut self, value: &str) {
        if let Some(charset) = content_type_charset(value) {
            match Encoding::from_charset(charset) {
                Some(e) => self.encoding = e,
                None => debug!("unsupported charset {}, keeping {}", charset, self.encoding.name()),
            }
        }

        self.content_type = Some(value.to_string());
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn set_content_length(&mut self, len: u64) {
        if !self.header_written {
            self.content_length = Some(len);
        }
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn set_encoding(&mut self, encoding: Encoding) {
        self.encoding = encoding;
    }

    pub fn set_footer(&mut self, name: &str, value: &str) {
        if check_field("footer", name, value) {
            self.footers.set(name, value);
        }
    }

    pub fn add_footer(&mut self, name: &str, value: &str) {
        if check_field("footer", name, value) {
            self.footers.add(name, value);
        }
    }

    pub fn is_keepalive(&self) -> bool {
        self.keepalive
    }

    pub fn kill_keepalive(&mut self) {
        self.keepalive = false;
    }

    pub fn is_header_written(&self) -> bool {
        self.header_written
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    // body bytes accepted for the current response
    pub fn body_written(&self) -> u64 {
        self.body_written
    }

    // true if the current response wrote past its declared length
    pub fn is_length_violated(&self) -> bool {
        self.length_violated
    }

    // writes that ran past the declared length, across all responses
    pub fn length_violations(&self) -> u64 {
        self.length_violations
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    // discards buffered output and response settings
    pub fn reset(&mut self) -> Result<(), FrameError> {
        if self.header_written {
            return Err(FrameError::Committed);
        }

        self.chain.clear(&self.pool);
        self.chars.clear();
        self.clear_response();

        Ok(())
    }

    fn body_allowed(&self) -> bool {
        !self.head_request && status_allows_body(self.status)
    }

    pub fn write(&mut self, sock: &mut dyn Socket, data: &[u8]) -> Result<(), io::Error> {
        // keep byte order with pending text
        if !self.chars.is_empty() {
            self.flush_chars(sock)?;
        }

        self.push_bytes(sock, data)
    }

    pub fn print(&mut self, sock: &mut dyn Socket, s: &str) -> Result<(), io::Error> {
        self.used_print = true;

        if self.chars.len() + s.len() > self.char_buffer_size {
            self.flush_chars(sock)?;

            if s.len() > self.char_buffer_size {
                self.chars.push_str(s);
                return self.flush_chars(sock);
            }
        }

        self.chars.push_str(s);

        Ok(())
    }

    fn flush_chars(&mut self, sock: &mut dyn Socket) -> Result<(), io::Error> {
        if self.chars.is_empty() {
            return Ok(());
        }

        let chars = mem::take(&mut self.chars);

        let result = match self.encoding {
            Encoding::Utf8 => self.push_bytes(sock, chars.as_bytes()),
            Encoding::Latin1 => {
                let mut encoded = mem::take(&mut self.encoded);
                encoded.clear();

                encoded.extend(chars.chars().map(|c| {
                    let c = c as u32;

                    if c <= 0xff {
                        c as u8
                    } else {
                        b'?'
                    }
                }));

                let result = self.push_bytes(sock, &encoded);
                self.encoded = encoded;

                result
            }
        };

        self.chars = chars;
        self.chars.clear();

        result
    }

    fn push_bytes(&mut self, sock: &mut dyn Socket, data: &[u8]) -> Result<(), io::Error> {
        if self.finished || (self.disconnected && self.ignore_disconnect) {
            return Ok(());
        }

        if !self.body_allowed() {
            return Ok(());
        }

        let mut data = data;

        if let Some(len) = self.content_length {
            let allowed = len.saturating_sub(self.body_written);

            if (data.len() as u64) > allowed {
                let (keep, excess) = data.split_at(allowed as usize);

                if !excess.iter().all(|&c| matches!(c, b'\r' | b'\n' | b' ' | b'\t')) {
                    self.length_violated = true;
                    self.length_violations += 1;

                    warn!(
                        "response wrote {} bytes past its content length of {}",
                        excess.len(),
                        len
                    );
                }

                data = keep;
            }
        }

        if data.is_empty() {
            return Ok(());
        }

        self.chain.write(&self.pool, data);
        self.body_written += data.len() as u64;

        if self.chain.len() >= self.buffer_capacity {
            self.flush_chain(sock, false)?;
        }

        Ok(())
    }

    fn check_write(&mut self, result: Result<(), io::Error>) -> Result<(), io::Error> {
        let e = match result {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        self.keepalive = false;
        self.chain.clear(&self.pool);

        if is_client_disconnect(&e) {
            self.disconnected = true;

            if self.ignore_disconnect {
                debug!("client disconnected, discarding output: {}", e);

                return Ok(());
            }
        }

        Err(e)
    }

    fn write_head(&mut self, sock: &mut dyn Socket, finishing: bool) -> Result<(), io::Error> {
        self.header_written = true;

        if self.version == Version::Http09 {
            return Ok(());
        }

        let body_allowed = self.body_allowed();

        if body_allowed && self.content_length.is_none() {
            if finishing {
                self.content_length = Some(self.chain.len() as u64);
            } else if self.version == Version::Http11 {
                self.chunked = true;
            } else {
                // close delimited
                self.keepalive = false;
            }
        }

        let mut head = mem::take(&mut self.head_buf);
        head.clear();

        let reason = match &self.reason {
            Some(s) => s.as_str(),
            None => reason_phrase(self.status),
        };

        write!(head, "{} {} {}\r\n", self.version.as_str(), self.status, reason)?;

        for (k, v) in self.headers.iter() {
            write!(head, "{}: {}\r\n", k, v)?;
        }

        if let Some(ct) = &self.content_type {
            if self.used_print && content_type_charset(ct).is_none() {
                write!(head, "Content-Type: {}; charset={}\r\n", ct, self.encoding.name())?;
            } else {
                write!(head, "Content-Type: {}\r\n", ct)?;
            }
        }

        if status_allows_body(self.status) {
            if let Some(len) = self.content_length {
                write!(head, "Content-Length: {}\r\n", len)?;
            } else if self.chunked {
                head.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
            }
        }

        write_date(&mut head)?;

        if let Some(server) = &self.server_header {
            write!(head, "Server: {}\r\n", server)?;
        }

        if !self.keepalive {
            head.extend_from_slice(b"Connection: close\r\n");
        } else if self.version == Version::Http10 {
            head.extend_from_slice(b"Connection: keep-alive\r\n");
        }

        // chunk headers start with the line ending that closes the block
        if !self.chunked {
            head.extend_from_slice(b"\r\n");
        }

        let result = sock.write_all(&head);
        self.head_buf = head;

        self.check_write(result)
    }

    fn flush_chain(&mut self, sock: &mut dyn Socket, finishing: bool) -> Result<(), io::Error> {
        if !self.header_written {
            self.write_head(sock, finishing)?;
        }

        while let Some(mut seg) = self.chain.pop_front() {
            let result = if self.disconnected {
                Ok(())
            } else if self.chunked {
                sock.write_all(seg.frame_chunk())
            } else {
                sock.write_all(seg.data())
            };

            self.pool.free(seg);

            self.check_write(result)?;
        }

        Ok(())
    }

    pub fn flush(&mut self, sock: &mut dyn Socket) -> Result<(), io::Error> {
        if self.finished {
            return Ok(());
        }

        self.flush_chars(sock)?;
        self.flush_chain(sock, false)?;

        let result = sock.flush();

        self.check_write(result)
    }

    /// Completes the response, writing any buffered output and the chunked
    /// terminator with footers.
    pub fn finish(&mut self, sock: &mut dyn Socket) -> Result<(), io::Error> {
        if self.finished {
            return Ok(());
        }

        self.flush_chars(sock)?;
        self.flush_chain(sock, true)?;

        self.finished = true;

        if self.chunked && !self.disconnected {
            let mut tail = mem::take(&mut self.head_buf);
            tail.clear();

            tail.extend_from_slice(CHUNK_END);

            for (k, v) in self.footers.iter() {
                write!(tail, "{}: {}\r\n", k, v)?;
            }

            tail.extend_from_slice(b"\r\n");

            let result = sock.write_all(&tail);
            self.head_buf = tail;

            self.check_write(result)?;
        }

        Ok(())
    }

    // idempotent
    pub fn close(&mut self, sock: &mut dyn Socket) -> Result<(), io::Error> {
        if self.closed {
            return Ok(());
        }

        let result = self.finish(sock);

        self.closed = true;

        if !self.keepalive {
            if let Err(e) = sock.shutdown_write() {
                debug!("shutdown failed: {}", e);
            }
        }

        result
    }
}

impl Drop for FrameWriter {
    fn drop(&mut self) {
        self.chain.clear(&self.pool);
    }
}

/// `io::Write` view of a framer bound to its socket.
pub struct ResponseWriter<'a> {
    frame: &'a mut FrameWriter,
    sock: &'a mut dyn Socket,
}

impl<'a> ResponseWriter<'a> {
    pub fn new(frame: &'a mut FrameWriter, sock: &'a mut dyn Socket) -> Self {
        Self { frame, sock }
    }

    pub fn print(&mut self, s: &str) -> Result<(), io::Error> {
        self.frame.print(self.sock, s)
    }

    pub fn frame(&mut self) -> &mut FrameWriter {
        self.frame
    }

    pub fn finish(&mut self) -> Result<(), io::Error> {
        self.frame.finish(self.sock)
    }
}

impl Write for ResponseWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        self.frame.write(self.sock, buf)?;

        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        self.frame.flush(self.sock)
    }
}
