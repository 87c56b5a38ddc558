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

//! Per-connection request processing.
//!
//! A connection is a `Box<Connection>` with exactly one owner at a time: the
//! worker running it, the selector while it waits for input, or the comet
//! controller while it is suspended. Each step consumes the box and returns
//! a `Flow` saying who owns it next.

use crate::core::buffer::{BufferPool, ReadBuffer};
use crate::core::config::EngineConfig;
use crate::handler::{Disposition, Exchange, Handler, HandlerError, ResumeCause};
use crate::http1::frame::{reason_phrase, FrameWriter};
use crate::http1::request::{RequestError, RequestReader, Version};
use crate::http1::state::{ConnectionState, IllegalTransition};
use crate::net::{self, Socket};
use crate::port::Accounting;
use crate::selector::Selector;
use crate::upgrade::{CometController, CometSupport, DuplexHandler, DuplexIo};
use log::{debug, error, warn};
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("client disconnect")]
    ClientDisconnect,

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    #[error(transparent)]
    Request(#[from] RequestError),
}

/// Who owns a connection after a processing step.
pub(crate) enum Flow {
    // keep running it on this thread
    Continue(Box<Connection>),

    // close it and return its buffers to the pool
    Exit(Box<Connection>),

    Destroy(Box<Connection>),

    // ownership moved to the selector, a comet controller or a task queue
    Detached,
}

pub(crate) fn finish(flow: Flow) {
    match flow {
        Flow::Continue(c) | Flow::Exit(c) => c.close(),
        Flow::Destroy(c) => c.destroy(),
        Flow::Detached => {}
    }
}

// runs the request loop for connections handed back to this thread
fn drive(flow: Flow) -> Flow {
    match flow {
        Flow::Continue(c) => c.request_loop(false),
        flow => flow,
    }
}

enum Outcome {
    Finished,
    Closed,
    Suspend(Arc<CometController>),
    Upgrade(Box<dyn DuplexHandler>),
}

enum Wait {
    Ready,
    Closed,
    Select,
}

// buffers kept across connections
struct Parts {
    rbuf: ReadBuffer,
    request: RequestReader,
    response: FrameWriter,
}

fn socket_mut(socket: &mut Option<Box<dyn Socket>>) -> Result<&mut dyn Socket, io::Error> {
    match socket {
        Some(s) => Ok(s.as_mut()),
        None => Err(io::Error::from(io::ErrorKind::NotConnected)),
    }
}

/// Shared context of all connections of a listener.
pub struct Engine {
    handler: Arc<dyn Handler>,
    port: Arc<dyn Accounting>,
    pool: Arc<BufferPool>,
    config: EngineConfig,
    selector: Option<Arc<dyn Selector>>,
    comet: Option<Arc<CometSupport>>,
    free: Mutex<Vec<Parts>>,
    next_id: AtomicU64,
}

impl Engine {
    pub fn new(config: EngineConfig, handler: Arc<dyn Handler>, port: Arc<dyn Accounting>) -> Self {
        let pool = Arc::new(BufferPool::new(
            config.segment_size,
            config.segment_pool_max,
        ));

        Self {
            handler,
            port,
            pool,
            config,
            selector: None,
            comet: None,
            free: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    // idle connections wait in the selector instead of a worker
    pub fn with_selector(mut self, selector: Arc<dyn Selector>) -> Self {
        self.selector = Some(selector);

        self
    }

    // enables comet requests
    pub fn with_comet(mut self, comet: Arc<CometSupport>) -> Self {
        self.comet = Some(comet);

        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn port(&self) -> &Arc<dyn Accounting> {
        &self.port
    }

    pub fn comet_support(&self) -> Option<&Arc<CometSupport>> {
        self.comet.as_ref()
    }

    // number of recycled connections ready for reuse
    pub fn free_count(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    fn new_parts(&self) -> Parts {
        Parts {
            rbuf: ReadBuffer::new(self.config.read_buffer_size),
            request: RequestReader::new(self.config.max_header_size),
            response: FrameWriter::new(
                Arc::clone(&self.pool),
                self.config.char_buffer_size,
                self.config.response_buffer_size,
                self.config.server_header.clone(),
            ),
        }
    }

    fn new_connection(self: &Arc<Self>) -> Box<Connection> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let (parts, state) = match self.free.lock().unwrap().pop() {
            Some(parts) => (parts, ConnectionState::Idle),
            None => (self.new_parts(), ConnectionState::Init),
        };

        Box::new(Connection {
            id,
            engine: Arc::clone(self),
            state,
            socket: None,
            rbuf: parts.rbuf,
            request: parts.request,
            response: parts.response,
            response_open: false,
            comet: None,
            duplex: None,
            connection_start: Instant::now(),
            request_count: 0,
            opened: false,
        })
    }

    fn recycle(&self, mut parts: Parts) {
        parts.rbuf.clear();
        parts.request.clear();

        let free = &mut *self.free.lock().unwrap();

        if free.len() < self.config.connection_pool_max {
            free.push(parts);
        }
    }

    /// Runs a newly accepted socket until it closes or detaches.
    pub fn serve(self: &Arc<Self>, mut sock: Box<dyn Socket>) {
        if !self.port.connection_open() {
            debug!("connection refused by accounting");

            sock.force_shutdown();

            return;
        }

        let mut conn = self.new_connection();
        let id = conn.id;

        // the connection is dropped during unwinding, which destroys it
        let result = panic::catch_unwind(AssertUnwindSafe(move || {
            let flow = match conn.attach(sock) {
                Ok(()) => conn.request_loop(false),
                Err(e) => {
                    error!("conn {}: {}", conn.id, e);

                    Flow::Destroy(conn)
                }
            };

            finish(flow);
        }));

        if result.is_err() {
            error!("conn {}: task panicked, connection destroyed", id);
        }
    }
}

pub struct Connection {
    id: u64,
    engine: Arc<Engine>,
    state: ConnectionState,
    socket: Option<Box<dyn Socket>>,
    rbuf: ReadBuffer,
    request: RequestReader,
    response: FrameWriter,
    // a response was started and not yet finished
    response_open: bool,
    comet: Option<Arc<CometController>>,
    duplex: Option<Box<dyn DuplexHandler>>,
    connection_start: Instant,
    request_count: u64,
    // counted as open by accounting
    opened: bool,
}

impl Connection {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().and_then(|s| s.raw_fd())
    }

    pub(crate) fn is_duplex(&self) -> bool {
        self.state.is_duplex()
    }

    pub(crate) fn keepalive_timeout(&self) -> Duration {
        self.engine.config.keepalive_timeout
    }

    fn attach(&mut self, sock: Box<dyn Socket>) -> Result<(), IllegalTransition> {
        self.socket = Some(sock);
        self.opened = true;
        self.connection_start = Instant::now();

        self.state = self.state.to_init()?.to_accept()?.to_read()?;

        debug!("conn {}: accepted", self.id);

        Ok(())
    }

    fn fail(self: Box<Self>, e: EngineError) -> Flow {
        match e {
            EngineError::IllegalTransition(e) => {
                error!("conn {}: {}", self.id, e);

                Flow::Destroy(self)
            }
            EngineError::Io(e) if net::is_timeout(&e) => {
                debug!("conn {}: timed out", self.id);

                Flow::Exit(self)
            }
            e => {
                debug!("conn {}: {}", self.id, e);

                Flow::Exit(self)
            }
        }
    }

    pub(crate) fn request_loop(mut self: Box<Self>, mut ready: bool) -> Flow {
        while self.state.is_allow_keepalive() {
            if !ready {
                self = match self.process_keepalive() {
                    Flow::Continue(c) => c,
                    flow => return flow,
                };
            }

            ready = false;

            self = match self.request_cycle() {
                Flow::Continue(c) => c,
                flow => return flow,
            };
        }

        Flow::Exit(self)
    }

    fn process_keepalive(mut self: Box<Self>) -> Flow {
        match self.keepalive_wait() {
            Ok(Wait::Ready) => Flow::Continue(self),
            Ok(Wait::Closed) => Flow::Exit(self),
            Ok(Wait::Select) => self.select(),
            Err(e) => self.fail(e),
        }
    }

    // makes sure input is available before the next request or duplex read
    fn keepalive_wait(&mut self) -> Result<Wait, EngineError> {
        // the first request is read directly under the socket timeout
        if self.request_count == 0 || self.rbuf.read_avail() > 0 {
            return Ok(Wait::Ready);
        }

        if let Some(ready) = self.quick_read()? {
            return Ok(if ready { Wait::Ready } else { Wait::Closed });
        }

        if !self.state.is_duplex() && !self.engine.port.keepalive_begin(self.connection_start) {
            debug!("conn {}: keepalive refused", self.id);

            return Ok(Wait::Closed);
        }

        self.state = self.state.to_keepalive(&*self.engine.port)?;

        if self.engine.config.select_enabled
            && self.engine.selector.is_some()
            && self.raw_fd().is_some()
        {
            self.state = self.state.to_keepalive_select()?;

            return Ok(Wait::Select);
        }

        let config = &self.engine.config;
        let sock = socket_mut(&mut self.socket)?;

        sock.set_read_timeout(Some(config.keepalive_timeout))?;
        let result = self.rbuf.fill_from(sock);
        sock.set_read_timeout(Some(config.socket_timeout))?;

        match result {
            Ok(0) => Ok(Wait::Closed),
            Ok(_) => Ok(Wait::Ready),
            Err(e) if net::is_timeout(&e) => {
                debug!("conn {}: keepalive timeout", self.id);

                Ok(Wait::Closed)
            }
            Err(e) => Err(e.into()),
        }
    }

    // non-blocking read. None if nothing arrived yet, Some(false) on EOF
    fn quick_read(&mut self) -> Result<Option<bool>, io::Error> {
        let sock = socket_mut(&mut self.socket)?;

        sock.set_nonblocking(true)?;
        let result = self.rbuf.fill_from(sock);
        sock.set_nonblocking(false)?;

        match result {
            Ok(0) => Ok(Some(false)),
            Ok(_) => Ok(Some(true)),
            Err(e) if net::is_timeout(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn select(self: Box<Self>) -> Flow {
        let selector = match &self.engine.selector {
            Some(s) => Arc::clone(s),
            None => return Flow::Exit(self),
        };

        match selector.keepalive(self) {
            Ok(()) => Flow::Detached,
            Err(conn) => {
                warn!("conn {}: unable to register with selector", conn.id);

                Flow::Exit(conn)
            }
        }
    }

    fn request_cycle(mut self: Box<Self>) -> Flow {
        if let Err(e) = self.activate() {
            return self.fail(e.into());
        }

        match self.handle_request() {
            Ok(Outcome::Finished) => self.finish_request(),
            Ok(Outcome::Closed) => Flow::Exit(self),
            Ok(Outcome::Suspend(c)) => self.suspend(c),
            Ok(Outcome::Upgrade(h)) => self.start_duplex(h),
            Err(e) => self.fail(e),
        }
    }

    fn activate(&mut self) -> Result<(), IllegalTransition> {
        self.state = self
            .state
            .to_active(&*self.engine.port, self.connection_start)?;

        Ok(())
    }

    fn finish_request(mut self: Box<Self>) -> Flow {
        match self.next_request() {
            Ok(()) => Flow::Continue(self),
            Err(e) => self.fail(e.into()),
        }
    }

    fn next_request(&mut self) -> Result<(), IllegalTransition> {
        self.state = self.state.to_finish_request()?;

        if self.state.is_allow_keepalive()
            && !self.engine.port.is_keepalive_allowed(self.connection_start)
        {
            self.state = self.state.to_kill_keepalive()?;
        }

        Ok(())
    }

    fn handle_request(&mut self) -> Result<Outcome, EngineError> {
        let sock = socket_mut(&mut self.socket)?;
        sock.set_read_timeout(Some(self.engine.config.socket_timeout))?;

        match self.request.read_request(&mut self.rbuf, sock) {
            Ok(true) => {}
            Ok(false) => {
                debug!("conn {}: closed by peer", self.id);

                return Ok(Outcome::Closed);
            }
            Err(RequestError::Io(e)) => return Err(e.into()),
            Err(e) => {
                self.send_error(&e)?;

                return Ok(Outcome::Finished);
            }
        }

        self.request_count += 1;

        let inv = self.request.invocation();

        debug!(
            "conn {}: request {} {} {} ({})",
            self.id,
            inv.method,
            inv.raw_uri,
            inv.version.as_str(),
            self.request_count
        );

        let keepalive = self.state.is_allow_keepalive() && inv.allows_keepalive();
        let version = inv.version;
        let head_request = inv.is_head();

        if !keepalive {
            self.state = self.state.to_kill_keepalive()?;
        }

        let handler = &self.engine.handler;

        self.response.start(
            version,
            head_request,
            keepalive,
            handler.ignore_client_disconnect(),
        );
        self.response_open = true;

        let result = {
            let sock = socket_mut(&mut self.socket)?;

            let mut ex = Exchange::new(
                self.id,
                &mut self.request,
                &mut self.rbuf,
                sock,
                &mut self.response,
                &mut self.comet,
                self.engine.comet.as_ref(),
            );

            handler.handle(&mut ex)
        };

        match result {
            Ok(Disposition::Complete) => {}
            Ok(Disposition::Suspend) => match &self.comet {
                Some(c) => return Ok(Outcome::Suspend(Arc::clone(c))),
                None => warn!(
                    "conn {}: handler suspended without starting comet",
                    self.id
                ),
            },
            Ok(Disposition::Upgrade(h)) => return Ok(Outcome::Upgrade(h)),
            Err(e) => self.handler_failed(e)?,
        }

        let result = self.complete_response();

        // comet started but the handler completed directly
        if let Some(c) = self.comet.take() {
            c.mark_complete();
            c.fire_listeners();
        }

        result?;

        Ok(Outcome::Finished)
    }

    // answers a request that could not be parsed and ends the connection
    fn send_error(&mut self, e: &RequestError) -> Result<(), EngineError> {
        let status = e.status().unwrap_or(400);

        debug!(
            "conn {}: bad request ({}) after {} requests: {}",
            self.id, status, self.request_count, e
        );

        self.state = self.state.to_kill_keepalive()?;

        self.response.start(Version::Http11, false, false, true);
        self.response.set_status(status);
        self.response.set_content_type("text/plain");

        let sock = socket_mut(&mut self.socket)?;

        self.response
            .print(sock, &format!("{} {}\n", status, reason_phrase(status)))?;
        self.response.close(sock)?;

        self.engine.port.request_complete();

        Ok(())
    }

    fn handler_failed(&mut self, e: HandlerError) -> Result<(), EngineError> {
        warn!(
            "conn {}: handler failed on {} {}: {}",
            self.id,
            self.request.invocation().method,
            self.request.invocation().raw_uri,
            e
        );

        self.state = self.state.to_kill_keepalive()?;

        if self.response.reset().is_ok() {
            self.response.set_status(500);
            self.response.set_content_type("text/plain");

            let sock = socket_mut(&mut self.socket)?;
            self.response.print(sock, "500 Internal Server Error\n")?;
        }

        self.response.kill_keepalive();

        Ok(())
    }

    fn complete_response(&mut self) -> Result<(), EngineError> {
        self.response_open = false;

        let sock = socket_mut(&mut self.socket)?;

        if let Err(e) = self.response.finish(sock) {
            if net::is_client_disconnect(&e) {
                self.engine.port.client_disconnect();

                return Err(EngineError::ClientDisconnect);
            }

            return Err(e.into());
        }

        if self.response.is_disconnected() {
            debug!("conn {}: client disconnect", self.id);

            self.engine.port.client_disconnect();
            self.state = self.state.to_kill_keepalive()?;
        } else if !self.response.is_keepalive() {
            self.state = self.state.to_kill_keepalive()?;
        }

        if self.response.is_length_violated() {
            warn!(
                "conn {}: {} {} wrote past its content length",
                self.id,
                self.request.invocation().method,
                self.request.invocation().raw_uri
            );
        }

        if self.state.is_allow_keepalive() {
            let sock = socket_mut(&mut self.socket)?;

            match self
                .request
                .skip_body(&mut self.rbuf, sock, self.engine.config.body_skip_max)
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!("conn {}: unread body too large to skip", self.id);

                    self.state = self.state.to_kill_keepalive()?;
                }
                Err(e) => {
                    debug!("conn {}: {}", self.id, RequestError::from_body(e));

                    self.state = self.state.to_kill_keepalive()?;
                }
            }
        }

        self.engine.port.request_complete();

        Ok(())
    }

    fn suspend(mut self: Box<Self>, c: Arc<CometController>) -> Flow {
        if let Err(e) = self.enter_comet() {
            return self.fail(e.into());
        }

        if !self.engine.port.is_suspend_allowed() {
            debug!("conn {}: suspend refused, closing after the response", self.id);

            match self.state.to_kill_keepalive() {
                Ok(state) => self.state = state,
                Err(e) => return self.fail(e.into()),
            }

            self.response.kill_keepalive();

            c.force_timeout();

            return self.resume(ResumeCause::Timeout);
        }

        if let Err(e) = self.to_comet_suspend() {
            return self.fail(e.into());
        }

        debug!("conn {}: suspended", self.id);

        match c.park(self) {
            None => Flow::Detached,
            Some((conn, cause)) => conn.resume(cause),
        }
    }

    fn enter_comet(&mut self) -> Result<(), IllegalTransition> {
        self.state = self.state.to_comet()?;

        Ok(())
    }

    fn to_comet_suspend(&mut self) -> Result<(), IllegalTransition> {
        self.state = self.state.to_comet_suspend(&*self.engine.port)?;

        Ok(())
    }

    pub(crate) fn run_resume(self: Box<Self>, cause: ResumeCause) {
        finish(drive(self.resume(cause)));
    }

    fn resume(mut self: Box<Self>, cause: ResumeCause) -> Flow {
        let c = match &self.comet {
            Some(c) => Arc::clone(c),
            None => {
                warn!("conn {}: resume without a comet request", self.id);

                return Flow::Exit(self);
            }
        };

        match self.resume_comet(&c, &cause) {
            Ok(true) => self.suspend(c),
            Ok(false) => self.finish_request(),
            Err(e) => self.fail(e),
        }
    }

    // returns true if the handler suspended again
    fn resume_comet(&mut self, c: &CometController, cause: &ResumeCause) -> Result<bool, EngineError> {
        if self.state.is_comet_suspend() {
            self.state = self.state.to_comet_resume(&*self.engine.port)?;
        }

        debug!("conn {}: comet resume {:?}", self.id, cause);

        let result = if *cause == ResumeCause::Complete {
            Ok(Disposition::Complete)
        } else {
            let sock = socket_mut(&mut self.socket)?;

            let mut ex = Exchange::new(
                self.id,
                &mut self.request,
                &mut self.rbuf,
                sock,
                &mut self.response,
                &mut self.comet,
                self.engine.comet.as_ref(),
            );

            self.engine.handler.resume(&mut ex, cause)
        };

        match result {
            Ok(Disposition::Suspend) if !c.is_complete() => return Ok(true),
            Ok(Disposition::Suspend) | Ok(Disposition::Complete) => {}
            Ok(Disposition::Upgrade(_)) => warn!(
                "conn {}: a resumed request cannot be upgraded",
                self.id
            ),
            Err(e) => self.handler_failed(e)?,
        }

        self.complete_comet(c)?;

        Ok(false)
    }

    fn complete_comet(&mut self, c: &CometController) -> Result<(), EngineError> {
        self.state = self.state.to_comet_complete(&*self.engine.port)?;

        let result = self.complete_response();

        c.mark_complete();
        c.take_pending();
        c.fire_listeners();

        self.comet = None;

        result
    }

    fn start_duplex(mut self: Box<Self>, handler: Box<dyn DuplexHandler>) -> Flow {
        self.duplex = Some(handler);

        match self.begin_duplex() {
            Ok(true) => self.duplex_loop(),
            Ok(false) => Flow::Exit(self),
            Err(e) => self.fail(e),
        }
    }

    fn begin_duplex(&mut self) -> Result<bool, EngineError> {
        self.state = self.state.to_duplex()?;

        debug!("conn {}: upgraded", self.id);

        self.response_open = false;

        let sock = socket_mut(&mut self.socket)?;

        self.response.finish(sock)?;
        sock.flush()?;

        self.engine.port.request_complete();

        let handler = match &mut self.duplex {
            Some(h) => h,
            None => return Ok(false),
        };

        let mut io = DuplexIo::new(&mut self.rbuf, sock);

        if let Err(e) = handler.on_start(&mut io) {
            debug!("conn {}: duplex start failed: {}", self.id, e);

            return Ok(false);
        }

        Ok(true)
    }

    pub(crate) fn run_duplex(self: Box<Self>) {
        finish(self.duplex_loop());
    }

    pub(crate) fn run_keepalive(self: Box<Self>) {
        finish(self.request_loop(true));
    }

    fn duplex_loop(mut self: Box<Self>) -> Flow {
        let retry_max = self.engine.config.duplex_stall_retry;

        let mut retries = retry_max;
        let mut last = self.rbuf.position();

        loop {
            if self.rbuf.read_avail() == 0 {
                match self.keepalive_wait() {
                    Ok(Wait::Ready) => {}
                    Ok(Wait::Closed) => return Flow::Exit(self),
                    Ok(Wait::Select) => return self.select(),
                    Err(e) => return self.fail(e),
                }
            }

            match self.duplex_read() {
                Ok(true) => {}
                Ok(false) => return Flow::Exit(self),
                Err(e) => return self.fail(e),
            }

            let pos = self.rbuf.position();

            if pos != last {
                last = pos;
                retries = retry_max;
            } else {
                retries = retries.saturating_sub(1);

                if retries == 0 {
                    warn!(
                        "conn {}: duplex handler was not processing any data. Shutting down.",
                        self.id
                    );

                    return Flow::Exit(self);
                }
            }
        }
    }

    fn duplex_read(&mut self) -> Result<bool, EngineError> {
        self.state = self.state.to_duplex_active(&*self.engine.port)?;

        let sock = socket_mut(&mut self.socket)?;

        let handler = match &mut self.duplex {
            Some(h) => h,
            None => return Ok(false),
        };

        let mut io = DuplexIo::new(&mut self.rbuf, sock);

        match handler.on_read(&mut io) {
            Ok(keep) => Ok(keep),
            Err(e) if net::is_client_disconnect(&e) => {
                debug!("conn {}: client disconnect", self.id);

                self.engine.port.client_disconnect();

                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    // ends comet and duplex use of the connection
    fn release_upgrades(&mut self) {
        if let Some(mut h) = self.duplex.take() {
            h.on_close();
        }

        if let Some(c) = self.comet.take() {
            c.mark_complete();
            c.fire_listeners();
        }
    }

    fn take_parts(&mut self) -> Parts {
        let pool = Arc::clone(&self.engine.pool);

        Parts {
            rbuf: mem::replace(&mut self.rbuf, ReadBuffer::new(0)),
            request: mem::replace(&mut self.request, RequestReader::new(0)),
            response: mem::replace(&mut self.response, FrameWriter::new(pool, 0, 0, None)),
        }
    }

    /// Closes the connection gracefully and recycles its buffers.
    pub fn close(mut self: Box<Self>) {
        self.release_upgrades();

        if let Some(mut sock) = self.socket.take() {
            if self.response_open {
                self.response_open = false;

                if let Err(e) = self.response.close(sock.as_mut()) {
                    debug!("conn {}: unable to finish response: {}", self.id, e);
                }
            }

            if let Err(e) = sock.flush() {
                debug!("conn {}: flush failed: {}", self.id, e);
            }

            if let Err(e) = sock.shutdown_write() {
                debug!("conn {}: shutdown failed: {}", self.id, e);
            }
        }

        if !self.opened {
            return;
        }

        self.opened = false;

        let port = Arc::clone(&self.engine.port);

        let state = self.state.to_closed(&*port).and_then(|s| s.to_idle());

        port.connection_close();

        debug!(
            "conn {}: closed after {} requests",
            self.id, self.request_count
        );

        match state {
            Ok(s) => {
                self.state = s;

                let parts = self.take_parts();
                self.engine.recycle(parts);
            }
            Err(e) => {
                error!("conn {}: {}", self.id, e);

                self.state = ConnectionState::Destroyed;
            }
        }
    }

    /// Drops the connection without a graceful shutdown. Its buffers are
    /// not reused.
    pub fn destroy(mut self: Box<Self>) {
        debug!("conn {}: destroy", self.id);

        self.release_upgrades();

        if let Some(mut sock) = self.socket.take() {
            sock.force_shutdown();
        }

        if self.opened {
            self.opened = false;

            let port = &*self.engine.port;

            if let Ok(s) = self.state.to_destroy(port) {
                self.state = s;
            }

            port.connection_close();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // dropped without close or destroy, e.g. while unwinding
        if self.opened {
            if let Some(sock) = &mut self.socket {
                sock.force_shutdown();
            }

            let port = &*self.engine.port;

            if let Ok(s) = self.state.to_destroy(port) {
                self.state = s;
            }

            port.connection_close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::test::ImmediateScheduler;
    use crate::handler::FnHandler;
    use crate::http1::request::CONTINUE_RESPONSE;
    use crate::net::test::MemorySocket;
    use crate::port::test::RecordingAccounting;
    use crate::port::{Port, PortLimits};
    use crate::upgrade::ListenerError;
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    fn test_config() -> EngineConfig {
        EngineConfig {
            segment_size: 256,
            segment_pool_max: 64,
            read_buffer_size: 2048,
            max_header_size: 1024,
            keepalive_timeout: Duration::from_millis(50),
            duplex_stall_retry: 8,
            server_header: None,
            ..Default::default()
        }
    }

    fn engine<H: Handler + 'static>(handler: H, port: &Arc<RecordingAccounting>) -> Arc<Engine> {
        let port: Arc<dyn Accounting> = port.clone();

        Arc::new(Engine::new(test_config(), Arc::new(handler), port))
    }

    fn comet_engine<H: Handler + 'static>(handler: H, port: &Arc<RecordingAccounting>) -> Arc<Engine> {
        let support = Arc::new(CometSupport::new(
            Arc::new(ImmediateScheduler),
            Duration::from_secs(10),
        ));

        let port: Arc<dyn Accounting> = port.clone();

        Arc::new(Engine::new(test_config(), Arc::new(handler), port).with_comet(support))
    }

    fn hello() -> impl Handler {
        FnHandler(|ex: &mut Exchange| -> Result<(), HandlerError> {
            let path = ex.path().to_string();

            ex.set_content_type("text/plain");
            ex.print(&format!("hello {}", path))?;

            Ok(())
        })
    }

    fn run(engine: &Arc<Engine>, sock: &MemorySocket) -> String {
        engine.serve(Box::new(sock.clone()));

        sock.output_string()
    }

    #[test]
    fn test_get() {
        let port = Arc::new(RecordingAccounting::new());
        let engine = engine(hello(), &port);

        let sock = MemorySocket::with_input(&[b"GET /a HTTP/1.1\r\nHost: example\r\n\r\n"]);
        let out = run(&engine, &sock);

        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{}", out);
        assert!(out.contains("Content-Length: 8\r\n"));
        assert!(out.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(!out.contains("Connection: close"));
        assert!(out.ends_with("\r\n\r\nhello /a"));

        assert_eq!(port.count("connection_open"), 1);
        assert_eq!(port.count("connection_close"), 1);
        assert_eq!(port.count("request_complete"), 1);
        assert_eq!(engine.free_count(), 1);
    }

    #[test]
    fn test_keepalive_requests() {
        struct Test {
            name: &'static str,
            input: &'static [&'static [u8]],
        }

        let tests = [
            Test {
                name: "pipelined",
                input: &[b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n"],
            },
            Test {
                name: "separate-reads",
                input: &[b"GET /a HTTP/1.1\r\n\r\n", b"GET /b HTTP/1.1\r\n\r\n"],
            },
        ];

        for test in tests.iter() {
            let port = Arc::new(RecordingAccounting::new());
            let engine = engine(hello(), &port);

            let sock = MemorySocket::with_input(test.input);
            let out = run(&engine, &sock);

            assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 2, "test={}", test.name);

            let a = out.find("hello /a").unwrap();
            let b = out.find("hello /b").unwrap();
            assert!(a < b, "test={}", test.name);

            // input was always ready, so no keepalive wait happened
            assert_eq!(port.count("keepalive_begin"), 0, "test={}", test.name);
            assert_eq!(port.count("request_complete"), 2, "test={}", test.name);
        }
    }

    #[test]
    fn test_keepalive_timeout() {
        let port = Arc::new(RecordingAccounting::new());
        let engine = engine(hello(), &port);

        // input stays open, so the wait for a second request times out
        let sock = MemorySocket::new();
        sock.push_input(b"GET / HTTP/1.1\r\n\r\n");

        let out = run(&engine, &sock);

        assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 1);
        assert_eq!(port.count("keepalive_begin"), 1);
        assert_eq!(port.count("keepalive_end"), 1);
        assert_eq!(port.count("connection_close"), 1);
        assert_eq!(sock.read_timeout(), Some(engine.config().socket_timeout));
        assert!(sock.is_write_shutdown());
    }

    #[test]
    fn test_connection_close() {
        struct Test {
            name: &'static str,
            input: &'static [u8],
            port: RecordingAccounting,
        }

        let tests = [
            Test {
                name: "http10",
                input: b"GET / HTTP/1.0\r\n\r\nGET / HTTP/1.0\r\n\r\n",
                port: RecordingAccounting::new(),
            },
            Test {
                name: "connection-close-header",
                input: b"GET / HTTP/1.1\r\nConnection: close\r\n\r\nGET / HTTP/1.1\r\n\r\n",
                port: RecordingAccounting::new(),
            },
            Test {
                name: "keepalive-denied",
                input: b"GET / HTTP/1.1\r\n\r\nGET / HTTP/1.1\r\n\r\n",
                port: RecordingAccounting::deny_keepalive_after(0),
            },
        ];

        for test in tests {
            let name = test.name;
            let port = Arc::new(test.port);
            let engine = engine(hello(), &port);

            let sock = MemorySocket::with_input(&[test.input]);
            let out = run(&engine, &sock);

            assert_eq!(out.matches(" 200 OK").count(), 1, "test={}", name);
            assert!(out.contains("Connection: close\r\n"), "test={}", name);
            assert!(sock.is_write_shutdown(), "test={}", name);
            assert_eq!(port.count("keepalive_begin"), 0, "test={}", name);
        }
    }

    #[test]
    fn test_head() {
        let port = Arc::new(RecordingAccounting::new());
        let engine = engine(hello(), &port);

        let sock = MemorySocket::with_input(&[b"HEAD / HTTP/1.1\r\n\r\n"]);
        let out = run(&engine, &sock);

        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
        assert!(!out.contains("hello"));
    }

    #[test]
    fn test_bad_requests() {
        struct Test {
            name: &'static str,
            input: Vec<u8>,
            status: &'static str,
        }

        let mut too_large = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
        too_large.extend_from_slice(&[b'a'; 1500]);
        too_large.extend_from_slice(b"\r\n\r\n");

        let tests = [
            Test {
                name: "bad-line",
                input: b"G\"T / HTTP/1.1\r\n\r\n".to_vec(),
                status: "HTTP/1.1 400 Bad Request\r\n",
            },
            Test {
                name: "too-large",
                input: too_large,
                status: "HTTP/1.1 431 Request Header Fields Too Large\r\n",
            },
            Test {
                name: "transfer-encoding",
                input: b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n".to_vec(),
                status: "HTTP/1.1 501 Not Implemented\r\n",
            },
        ];

        for test in tests.iter() {
            let port = Arc::new(RecordingAccounting::new());
            let engine = engine(hello(), &port);

            let sock = MemorySocket::with_input(&[&test.input]);
            let out = run(&engine, &sock);

            assert!(out.starts_with(test.status), "test={} out={}", test.name, out);
            assert!(out.contains("Connection: close\r\n"), "test={}", test.name);
            assert!(!out.contains("hello"), "test={}", test.name);
            assert!(sock.is_write_shutdown(), "test={}", test.name);
            assert_eq!(port.count("connection_close"), 1, "test={}", test.name);
        }
    }

    #[test]
    fn test_continue() {
        let port = Arc::new(RecordingAccounting::new());

        let echo = FnHandler(|ex: &mut Exchange| -> Result<(), HandlerError> {
            let mut body = Vec::new();
            ex.input_stream()?.read_to_end(&mut body)?;

            ex.write(&body)?;

            Ok(())
        });

        let engine = engine(echo, &port);

        let sock = MemorySocket::with_input(&[
            b"POST / HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\n",
            b"hello",
        ]);
        let out = run(&engine, &sock);

        let expected = String::from_utf8_lossy(CONTINUE_RESPONSE);
        assert!(out.starts_with(&*expected));
        assert_eq!(out.matches("100 Continue").count(), 1);
        assert!(out[expected.len()..].starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.ends_with("hello"));
    }

    #[test]
    fn test_chunked_request() {
        let port = Arc::new(RecordingAccounting::new());

        let echo = FnHandler(|ex: &mut Exchange| -> Result<(), HandlerError> {
            let mut body = String::new();
            ex.reader()?.read_to_string(&mut body)?;

            let trailer = ex.trailer("x-check").unwrap_or("").to_string();
            ex.print(&format!("{}|{}", body, trailer))?;

            Ok(())
        });

        let engine = engine(echo, &port);

        let sock = MemorySocket::with_input(&[
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n",
            b"3\r\nabc\r\n2\r\nde\r\n0\r\nX-Check: ok\r\n\r\n",
        ]);
        let out = run(&engine, &sock);

        assert!(out.ends_with("abcde|ok"), "{}", out);
    }

    #[test]
    fn test_unread_body() {
        struct Test {
            name: &'static str,
            body_skip_max: u64,
            responses: usize,
        }

        let tests = [
            Test {
                name: "skipped",
                body_skip_max: 64,
                responses: 2,
            },
            Test {
                name: "too-large",
                body_skip_max: 4,
                responses: 1,
            },
        ];

        for test in tests.iter() {
            let port = Arc::new(RecordingAccounting::new());
            let port_dyn: Arc<dyn Accounting> = port.clone();

            let config = EngineConfig {
                body_skip_max: test.body_skip_max,
                ..test_config()
            };

            let engine = Arc::new(Engine::new(config, Arc::new(hello()), port_dyn));

            let sock = MemorySocket::with_input(&[
                b"POST /a HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789GET /b HTTP/1.1\r\n\r\n",
            ]);
            let out = run(&engine, &sock);

            assert_eq!(
                out.matches("HTTP/1.1 200 OK").count(),
                test.responses,
                "test={}",
                test.name
            );
        }
    }

    #[test_log::test]
    fn test_handler_error() {
        let port = Arc::new(RecordingAccounting::new());

        let failing = FnHandler(|ex: &mut Exchange| -> Result<(), HandlerError> {
            ex.print("partial")?;

            Err(HandlerError::Failed(String::from("boom")))
        });

        let engine = engine(failing, &port);

        let sock = MemorySocket::with_input(&[b"GET / HTTP/1.1\r\n\r\nGET / HTTP/1.1\r\n\r\n"]);
        let out = run(&engine, &sock);

        assert!(out.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(out.contains("Connection: close\r\n"));
        assert!(!out.contains("partial"));
        assert_eq!(out.matches("HTTP/1.1").count(), 1);
    }

    #[test_log::test]
    fn test_handler_panic() {
        let port = Arc::new(RecordingAccounting::new());

        let panicking = FnHandler(|_: &mut Exchange| -> Result<(), HandlerError> {
            panic!("handler panicked");
        });

        let engine = engine(panicking, &port);

        let sock = MemorySocket::with_input(&[b"GET / HTTP/1.1\r\n\r\n"]);
        run(&engine, &sock);

        assert!(sock.is_force_shutdown());
        assert_eq!(port.count("connection_close"), 1);
        assert_eq!(engine.free_count(), 0);

        // later connections are contained the same way
        let engine2 = Arc::clone(&engine);
        let sock = MemorySocket::with_input(&[b"GET / HTTP/1.1\r\n\r\n"]);
        engine2.serve(Box::new(sock.clone()));
        assert!(sock.is_force_shutdown());
        assert_eq!(port.count("connection_close"), 2);
    }

    #[test]
    fn test_connection_refused() {
        let limits = PortLimits {
            connection_max: 0,
            ..PortLimits::from_config(&test_config())
        };

        let port: Arc<dyn Accounting> = Arc::new(Port::new(limits));
        let engine = Arc::new(Engine::new(test_config(), Arc::new(hello()), port));

        let sock = MemorySocket::with_input(&[b"GET / HTTP/1.1\r\n\r\n"]);
        let out = run(&engine, &sock);

        assert_eq!(out, "");
        assert!(sock.is_force_shutdown());
    }

    #[test]
    fn test_recycled_connections() {
        let port = Arc::new(RecordingAccounting::new());
        let engine = engine(hello(), &port);

        for _ in 0..2 {
            let sock = MemorySocket::with_input(&[b"GET / HTTP/1.1\r\n\r\n"]);
            run(&engine, &sock);
        }

        assert_eq!(engine.free_count(), 1);

        let allocs = engine.pool().stats().fresh_allocs;

        for _ in 0..3 {
            let sock = MemorySocket::with_input(&[b"GET / HTTP/1.1\r\n\r\n"]);
            let out = run(&engine, &sock);
            assert!(out.ends_with("hello /"));
        }

        assert_eq!(engine.free_count(), 1);
        assert_eq!(engine.pool().stats().fresh_allocs, allocs);
    }

    type Slot = Arc<Mutex<Option<Arc<CometController>>>>;
    type Fired = Arc<Mutex<Vec<bool>>>;

    struct CometHandler {
        slot: Slot,
        fired: Fired,
        timeout: Option<Duration>,
        wake_early: bool,
    }

    impl CometHandler {
        fn new() -> Self {
            Self {
                slot: Arc::new(Mutex::new(None)),
                fired: Arc::new(Mutex::new(Vec::new())),
                timeout: None,
                wake_early: false,
            }
        }
    }

    impl Handler for CometHandler {
        fn handle(&self, ex: &mut Exchange) -> Result<Disposition, HandlerError> {
            let c = ex.start_comet()?;

            if let Some(timeout) = self.timeout {
                c.set_timeout(timeout);
            }

            let fired = Arc::clone(&self.fired);

            c.add_listener(Box::new(move |timed_out: bool| -> Result<(), ListenerError> {
                fired.lock().unwrap().push(timed_out);

                Ok(())
            }));

            if self.wake_early {
                c.wake();
            }

            *self.slot.lock().unwrap() = Some(c);

            Ok(Disposition::Suspend)
        }

        fn resume(&self, ex: &mut Exchange, cause: &ResumeCause) -> Result<Disposition, HandlerError> {
            match cause {
                ResumeCause::Timeout => ex.print("timeout")?,
                ResumeCause::Dispatch(path) => {
                    ex.print(&format!("dispatch {}", path))?;
                }
                _ => ex.print("woke")?,
            }

            Ok(Disposition::Complete)
        }
    }

    #[test]
    fn test_comet_wake() {
        let port = Arc::new(RecordingAccounting::new());

        let handler = CometHandler::new();
        let slot = Arc::clone(&handler.slot);
        let fired = Arc::clone(&handler.fired);

        let engine = comet_engine(handler, &port);

        let sock = MemorySocket::with_input(&[b"GET /wait HTTP/1.1\r\n\r\n"]);
        let out = run(&engine, &sock);

        // suspended
        assert_eq!(out, "");
        assert_eq!(port.count("comet_suspend"), 1);
        assert_eq!(port.count("connection_close"), 0);

        let c = slot.lock().unwrap().take().unwrap();
        assert!(c.is_suspended());
        assert_eq!(engine.comet_support().unwrap().registry().len(), 1);

        assert!(c.wake());

        let out = sock.output_string();
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.ends_with("woke"));

        assert!(c.is_complete());
        assert!(!c.is_timed_out());
        assert_eq!(*fired.lock().unwrap(), vec![false]);
        assert!(engine.comet_support().unwrap().registry().is_empty());

        assert_eq!(port.count("comet_detach"), 1);
        assert_eq!(port.count("connection_close"), 1);

        // late wakes are refused
        assert!(!c.wake());
    }

    #[test]
    fn test_comet_timeout() {
        let port = Arc::new(RecordingAccounting::new());

        let mut handler = CometHandler::new();
        handler.timeout = Some(Duration::from_millis(0));

        let slot = Arc::clone(&handler.slot);
        let fired = Arc::clone(&handler.fired);

        let engine = comet_engine(handler, &port);

        let sock = MemorySocket::with_input(&[b"GET /wait HTTP/1.1\r\n\r\n"]);
        run(&engine, &sock);

        let c = slot.lock().unwrap().take().unwrap();

        let registry = engine.comet_support().unwrap().registry();
        assert_eq!(registry.sweep(Instant::now()), 1);

        assert!(sock.output_string().ends_with("timeout"));
        assert!(c.is_timed_out());
        assert_eq!(*fired.lock().unwrap(), vec![true]);
        assert_eq!(port.count("connection_close"), 1);
    }

    #[test]
    fn test_comet_suspend_refused() {
        let port = Arc::new(RecordingAccounting::deny_suspend());

        let handler = CometHandler::new();
        let slot = Arc::clone(&handler.slot);

        let engine = comet_engine(handler, &port);

        let sock = MemorySocket::with_input(&[
            b"GET /wait HTTP/1.1\r\n\r\nGET /wait HTTP/1.1\r\n\r\n",
        ]);
        let out = run(&engine, &sock);

        // answered as timed out, then closed without reading the next request
        assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 1, "{}", out);
        assert!(out.contains("Connection: close\r\n"), "{}", out);
        assert!(out.ends_with("timeout"), "{}", out);

        let c = slot.lock().unwrap().take().unwrap();
        assert!(c.is_timed_out());
        assert!(engine.comet_support().unwrap().registry().is_empty());

        assert_eq!(port.count("comet_suspend"), 0);
        assert_eq!(port.count("request_complete"), 1);
        assert_eq!(port.count("connection_close"), 1);

        // the same limit through the real port
        let limits = PortLimits {
            suspend_max: 0,
            ..PortLimits::from_config(&test_config())
        };

        let support = Arc::new(CometSupport::new(
            Arc::new(ImmediateScheduler),
            Duration::from_secs(10),
        ));
        let real: Arc<dyn Accounting> = Arc::new(Port::new(limits));
        let engine = Arc::new(
            Engine::new(test_config(), Arc::new(CometHandler::new()), real).with_comet(support),
        );

        let sock = MemorySocket::with_input(&[
            b"GET /wait HTTP/1.1\r\n\r\nGET /wait HTTP/1.1\r\n\r\n",
        ]);
        let out = run(&engine, &sock);

        assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 1, "{}", out);
        assert!(out.contains("Connection: close\r\n"), "{}", out);
    }

    #[test_log::test]
    fn test_length_violation_then_clean() {
        let port = Arc::new(RecordingAccounting::new());

        let handler = FnHandler(|ex: &mut Exchange| -> Result<(), HandlerError> {
            ex.set_header("Content-Length", "2");

            if ex.path() == "/bad" {
                ex.write(b"hello!")?;
            } else {
                ex.write(b"ok")?;
            }

            Ok(())
        });

        let engine = engine(handler, &port);

        let sock = MemorySocket::with_input(&[
            b"GET /bad HTTP/1.1\r\n\r\nGET /good HTTP/1.1\r\n\r\n",
        ]);
        let out = run(&engine, &sock);

        assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 2, "{}", out);
        assert!(!out.contains("hello!"));
        assert!(out.ends_with("\r\n\r\nok"), "{}", out);
        assert_eq!(port.count("request_complete"), 2);

        // the recycled framer starts clean but keeps the total
        let parts = engine.free.lock().unwrap().pop().unwrap();
        assert!(!parts.response.is_length_violated());
        assert_eq!(parts.response.length_violations(), 1);
    }

    #[test]
    fn test_comet_wake_before_park() {
        let port = Arc::new(RecordingAccounting::new());

        let mut handler = CometHandler::new();
        handler.wake_early = true;

        let fired = Arc::clone(&handler.fired);

        let engine = comet_engine(handler, &port);

        let sock = MemorySocket::with_input(&[b"GET /wait HTTP/1.1\r\n\r\n"]);
        let out = run(&engine, &sock);

        assert!(out.ends_with("woke"));
        assert_eq!(*fired.lock().unwrap(), vec![false]);
        assert!(engine.comet_support().unwrap().registry().is_empty());
    }

    #[test]
    fn test_comet_complete_and_dispatch() {
        struct Test {
            name: &'static str,
            dispatch: bool,
            expected: &'static str,
        }

        let tests = [
            Test {
                name: "complete",
                dispatch: false,
                expected: "\r\n\r\n",
            },
            Test {
                name: "dispatch",
                dispatch: true,
                expected: "dispatch /next",
            },
        ];

        for test in tests.iter() {
            let port = Arc::new(RecordingAccounting::new());

            let handler = CometHandler::new();
            let slot = Arc::clone(&handler.slot);
            let fired = Arc::clone(&handler.fired);

            let engine = comet_engine(handler, &port);

            let sock = MemorySocket::with_input(&[b"GET /wait HTTP/1.1\r\nHost: h\r\n\r\nGET /x HTTP/1.1\r\n\r\n"]);
            run(&engine, &sock);

            let c = slot.lock().unwrap().take().unwrap();

            if test.dispatch {
                assert!(c.dispatch("/next"), "test={}", test.name);
            } else {
                assert!(c.complete(), "test={}", test.name);
            }

            let out = sock.output_string();
            let first = out.find("HTTP/1.1 200 OK").unwrap();
            let first_end = out[first..].find(test.expected).unwrap();
            assert!(first_end > 0, "test={}", test.name);

            assert_eq!(*fired.lock().unwrap(), vec![false], "test={}", test.name);

            // the pipelined request suspends in turn
            assert!(slot.lock().unwrap().is_some(), "test={}", test.name);
            assert_eq!(port.count("comet_suspend"), 2, "test={}", test.name);
        }
    }

    struct Echo {
        closed: Arc<AtomicBool>,
    }

    impl DuplexHandler for Echo {
        fn on_start(&mut self, io: &mut DuplexIo) -> Result<(), io::Error> {
            io.write_all(b"ready;")
        }

        fn on_read(&mut self, io: &mut DuplexIo) -> Result<bool, io::Error> {
            let data = io.buffered().to_vec();
            io.consume(data.len());

            if data == b"quit" {
                return Ok(false);
            }

            io.write_all(&data)?;

            Ok(true)
        }

        fn on_close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct Stalled {
        reads: Arc<AtomicUsize>,
    }

    impl DuplexHandler for Stalled {
        fn on_read(&mut self, _io: &mut DuplexIo) -> Result<bool, io::Error> {
            self.reads.fetch_add(1, Ordering::SeqCst);

            Ok(true)
        }
    }

    struct UpgradeHandler<F>(F);

    impl<F> Handler for UpgradeHandler<F>
    where
        F: Fn() -> Box<dyn DuplexHandler> + Send + Sync,
    {
        fn handle(&self, ex: &mut Exchange) -> Result<Disposition, HandlerError> {
            ex.set_status(101);
            ex.set_header("Upgrade", "echo");
            ex.set_header("Connection", "Upgrade");

            Ok(Disposition::Upgrade((self.0)()))
        }
    }

    #[test]
    fn test_duplex_echo() {
        struct Test {
            name: &'static str,
            input: &'static [&'static [u8]],
            echoed: &'static str,
        }

        let tests = [
            Test {
                name: "eof",
                input: &[b"GET / HTTP/1.1\r\nUpgrade: echo\r\n\r\n", b"ping", b"pong"],
                echoed: "ready;pingpong",
            },
            Test {
                name: "handler-ends",
                input: &[b"GET / HTTP/1.1\r\nUpgrade: echo\r\n\r\n", b"ping", b"quit", b"late"],
                echoed: "ready;ping",
            },
        ];

        for test in tests.iter() {
            let port = Arc::new(RecordingAccounting::new());
            let closed = Arc::new(AtomicBool::new(false));

            let c = Arc::clone(&closed);
            let handler = UpgradeHandler(move || -> Box<dyn DuplexHandler> {
                Box::new(Echo {
                    closed: Arc::clone(&c),
                })
            });

            let engine = engine(handler, &port);

            let sock = MemorySocket::with_input(test.input);
            let out = run(&engine, &sock);

            assert!(
                out.starts_with("HTTP/1.1 101 Switching Protocols\r\n"),
                "test={}",
                test.name
            );
            assert!(out.contains("Upgrade: echo\r\n"), "test={}", test.name);
            assert!(!out.contains("Content-Length"), "test={}", test.name);

            let body = &out[out.find("\r\n\r\n").unwrap() + 4..];
            assert_eq!(body, test.echoed, "test={}", test.name);

            assert!(closed.load(Ordering::SeqCst), "test={}", test.name);
            assert_eq!(port.count("connection_close"), 1, "test={}", test.name);
        }
    }

    #[test_log::test]
    fn test_duplex_stall() {
        let port = Arc::new(RecordingAccounting::new());
        let reads = Arc::new(AtomicUsize::new(0));

        let r = Arc::clone(&reads);
        let handler = UpgradeHandler(move || -> Box<dyn DuplexHandler> {
            Box::new(Stalled {
                reads: Arc::clone(&r),
            })
        });

        let engine = engine(handler, &port);

        let sock = MemorySocket::with_input(&[b"GET / HTTP/1.1\r\n\r\n", b"data"]);
        run(&engine, &sock);

        assert_eq!(reads.load(Ordering::SeqCst), test_config().duplex_stall_retry);
        assert_eq!(port.count("connection_close"), 1);
    }
}
