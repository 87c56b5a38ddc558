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
use crate::http1::cookie::Cookie;
use crate::http1::frame::{FrameError, FrameWriter, ResponseWriter};
use crate::http1::request::{
    BodyError, BodyReader, BodyStream, Invocation, RequestReader, Version, CONTINUE_RESPONSE,
};
use crate::net::Socket;
use crate::upgrade::{CometController, CometSupport, DuplexHandler, UpgradeError};
use log::debug;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Body(#[from] BodyError),

    #[error(transparent)]
    Upgrade(#[from] UpgradeError),

    #[error("{0}")]
    Failed(String),
}

/// What the engine does with the connection once a handler returns.
pub enum Disposition {
    /// Finish the response. The connection may be reused.
    Complete,

    /// Park the request. Requires `Exchange::start_comet` first.
    Suspend,

    /// Hand the connection to a protocol handler for good.
    Upgrade(Box<dyn DuplexHandler>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeCause {
    Wake,
    Dispatch(String),
    Complete,
    Timeout,
}

pub trait Handler: Send + Sync {
    fn handle(&self, ex: &mut Exchange) -> Result<Disposition, HandlerError>;

    /// Runs when a suspended request is woken, dispatched or timed out.
    fn resume(&self, _ex: &mut Exchange, _cause: &ResumeCause) -> Result<Disposition, HandlerError> {
        Ok(Disposition::Complete)
    }

    // if true, writes to a peer that went away are silently discarded
    fn ignore_client_disconnect(&self) -> bool {
        true
    }
}

/// One request/response exchange as seen by a handler.
pub struct Exchange<'a> {
    id: u64,
    peer_addr: Option<SocketAddr>,
    request: &'a mut RequestReader,
    rbuf: &'a mut ReadBuffer,
    sock: &'a mut dyn Socket,
    response: &'a mut FrameWriter,
    comet: &'a mut Option<Arc<CometController>>,
    comet_support: Option<&'a Arc<CometSupport>>,
}

impl<'a> Exchange<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        request: &'a mut RequestReader,
        rbuf: &'a mut ReadBuffer,
        sock: &'a mut dyn Socket,
        response: &'a mut FrameWriter,
        comet: &'a mut Option<Arc<CometController>>,
        comet_support: Option<&'a Arc<CometSupport>>,
    ) -> Self {
        let peer_addr = sock.peer_addr();

        Self {
            id,
            peer_addr,
            request,
            rbuf,
            sock,
            response,
            comet,
            comet_support,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn invocation(&self) -> &Invocation {
        self.request.invocation()
    }

    pub fn method(&self) -> &str {
        &self.request.invocation().method
    }

    pub fn path(&self) -> &str {
        &self.request.invocation().path
    }

    pub fn query(&self) -> Option<&str> {
        self.request.invocation().query.as_deref()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.request.header(name)
    }

    pub fn header_bytes(&self, name: &str) -> Option<&[u8]> {
        self.request.header_bytes(name)
    }

    pub fn headers(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.request.headers()
    }

    pub fn cookies(&self) -> &[Cookie] {
        self.request.cookies()
    }

    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.request.cookie(name)
    }

    pub fn trailer(&self, name: &str) -> Option<&str> {
        self.request.trailers().get(name)
    }

    fn open_body(&mut self, as_reader: bool) -> Result<(), BodyError> {
        let send_continue = self.request.open_body(as_reader)?;

        if send_continue
            && self.request.invocation().version >= Version::Http11
            && !self.response.is_header_written()
        {
            debug!("conn {}: sending 100 continue", self.id);

            self.sock.write_all(CONTINUE_RESPONSE)?;
            self.sock.flush()?;
        }

        Ok(())
    }

    /// Byte stream over the request body. May be opened more than once,
    /// but not after `reader`.
    pub fn input_stream(&mut self) -> Result<BodyStream<'_>, BodyError> {
        self.open_body(false)?;

        Ok(self.request.body_stream(self.rbuf, self.sock))
    }

    /// Buffered reader over the request body. Exclusive with
    /// `input_stream`.
    pub fn reader(&mut self) -> Result<BodyReader<'_>, BodyError> {
        self.open_body(true)?;

        Ok(BodyReader::new(self.request.body_stream(self.rbuf, self.sock)))
    }

    pub fn set_status(&mut self, code: u16) {
        self.response.set_status(code);
    }

    pub fn set_status_with_reason(&mut self, code: u16, reason: &str) {
        self.response.set_status_with_reason(code, reason);
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.response.set_header(name, value);
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.response.add_header(name, value);
    }

    pub fn remove_header(&mut self, name: &str) -> bool {
        self.response.remove_header(name)
    }

    pub fn set_content_type(&mut self, value: &str) {
        self.response.set_content_type(value);
    }

    pub fn set_content_length(&mut self, len: u64) {
        self.response.set_content_length(len);
    }

    pub fn set_footer(&mut self, name: &str, value: &str) {
        self.response.set_footer(name, value);
    }

    pub fn add_footer(&mut self, name: &str, value: &str) {
        self.response.add_footer(name, value);
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), io::Error> {
        self.response.write(self.sock, data)
    }

    pub fn print(&mut self, s: &str) -> Result<(), io::Error> {
        self.response.print(self.sock, s)
    }

    pub fn flush(&mut self) -> Result<(), io::Error> {
        self.response.flush(self.sock)
    }

    pub fn writer(&mut self) -> ResponseWriter<'_> {
        ResponseWriter::new(self.response, self.sock)
    }

    pub fn is_committed(&self) -> bool {
        self.response.is_header_written()
    }

    pub fn reset(&mut self) -> Result<(), FrameError> {
        self.response.reset()
    }

    pub fn kill_keepalive(&mut self) {
        self.response.kill_keepalive();
    }

    /// Turns this request into a comet request. Return
    /// `Disposition::Suspend` afterwards to park it.
    pub fn start_comet(&mut self) -> Result<Arc<CometController>, UpgradeError> {
        let support = match self.comet_support {
            Some(s) => s,
            None => return Err(UpgradeError::CometUnsupported),
        };

        if self.comet.is_some() {
            return Err(UpgradeError::CometAlreadyStarted);
        }

        let c = CometController::new(self.id, Arc::clone(support));
        *self.comet = Some(Arc::clone(&c));

        Ok(c)
    }

    pub fn comet(&self) -> Option<&Arc<CometController>> {
        self.comet.as_ref()
    }
}

/// Adapts a closure into a handler that always completes.
pub struct FnHandler<F>(pub F);

impl<F> Handler for FnHandler<F>
where
    F: Fn(&mut Exchange) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, ex: &mut Exchange) -> Result<Disposition, HandlerError> {
        (self.0)(ex)?;

        Ok(Disposition::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::buffer::BufferPool;
    use crate::executor::test::ImmediateScheduler;
    use crate::net::test::MemorySocket;
    use std::io::Read;
    use std::time::Duration;

    struct Parts {
        request: RequestReader,
        rbuf: ReadBuffer,
        sock: MemorySocket,
        response: FrameWriter,
        comet: Option<Arc<CometController>>,
    }

    fn parts(input: &[&[u8]]) -> Parts {
        let mut p = Parts {
            request: RequestReader::new(1024),
            rbuf: ReadBuffer::new(1024),
            sock: MemorySocket::with_input(input),
            response: FrameWriter::new(Arc::new(BufferPool::new(256, 16)), 64, 1024, None),
            comet: None,
        };

        assert!(p.request.read_request(&mut p.rbuf, &mut p.sock).unwrap());

        let inv = p.request.invocation();
        p.response
            .start(inv.version, inv.is_head(), inv.allows_keepalive(), true);

        p
    }

    #[test]
    fn test_continue_sent_once() {
        let mut p = parts(&[
            b"POST /up HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 4\r\n\r\n",
            b"data",
        ]);

        let out_sock = p.sock.clone();

        let mut ex = Exchange::new(
            1,
            &mut p.request,
            &mut p.rbuf,
            &mut p.sock,
            &mut p.response,
            &mut p.comet,
            None,
        );

        assert_eq!(out_sock.output(), b"");

        let mut body = Vec::new();
        ex.input_stream().unwrap().read_to_end(&mut body).unwrap();
        assert_eq!(body, b"data");

        ex.input_stream().unwrap();

        assert_eq!(out_sock.output(), CONTINUE_RESPONSE);

        // the reader view is now refused
        assert!(matches!(ex.reader(), Err(BodyError::StreamInUse)));
    }

    #[test]
    fn test_continue_not_sent_after_commit() {
        let mut p = parts(&[b"POST / HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 1\r\n\r\nx"]);
        let out_sock = p.sock.clone();

        let mut ex = Exchange::new(
            1,
            &mut p.request,
            &mut p.rbuf,
            &mut p.sock,
            &mut p.response,
            &mut p.comet,
            None,
        );

        ex.print("early").unwrap();
        ex.flush().unwrap();
        assert!(ex.is_committed());

        let mut line = String::new();
        ex.reader().unwrap().read_to_string(&mut line).unwrap();
        assert_eq!(line, "x");

        assert!(!out_sock.output_string().contains("100 Continue"));
    }

    #[test]
    fn test_request_accessors() {
        let mut p = parts(&[b"GET /a/b?x=1 HTTP/1.1\r\nHost: h\r\nCookie: s=abc\r\n\r\n"]);

        let ex = Exchange::new(
            7,
            &mut p.request,
            &mut p.rbuf,
            &mut p.sock,
            &mut p.response,
            &mut p.comet,
            None,
        );

        assert_eq!(ex.id(), 7);
        assert_eq!(ex.method(), "GET");
        assert_eq!(ex.path(), "/a/b");
        assert_eq!(ex.query(), Some("x=1"));
        assert_eq!(ex.header("host"), Some("h"));
        assert_eq!(ex.cookie("s").unwrap().value, "abc");
        assert_eq!(ex.headers().count(), 2);
        assert_eq!(ex.peer_addr(), None);
    }

    #[test]
    fn test_start_comet() {
        let mut p = parts(&[b"GET / HTTP/1.1\r\n\r\n"]);

        {
            let mut ex = Exchange::new(
                1,
                &mut p.request,
                &mut p.rbuf,
                &mut p.sock,
                &mut p.response,
                &mut p.comet,
                None,
            );

            assert_eq!(ex.start_comet().err(), Some(UpgradeError::CometUnsupported));
        }

        let support = Arc::new(CometSupport::new(
            Arc::new(ImmediateScheduler),
            Duration::from_secs(1),
        ));

        let mut ex = Exchange::new(
            1,
            &mut p.request,
            &mut p.rbuf,
            &mut p.sock,
            &mut p.response,
            &mut p.comet,
            Some(&support),
        );

        let c = ex.start_comet().unwrap();
        assert_eq!(c.connection_id(), 1);
        assert!(ex.comet().is_some());

        assert_eq!(ex.start_comet().err(), Some(UpgradeError::CometAlreadyStarted));
    }
}
