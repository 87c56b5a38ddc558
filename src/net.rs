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

use log::debug;
use socket2::{Domain, Protocol, Type};
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

const LISTEN_BACKLOG: i32 = 1024;

/// A connected byte stream the engine can drive.
///
/// Reads honor the read timeout: a read that times out fails with
/// `WouldBlock` or `TimedOut`.
pub trait Socket: Read + Write + Send {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), io::Error>;

    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), io::Error>;

    fn shutdown_write(&mut self) -> Result<(), io::Error>;

    // closes both directions, ignoring errors
    fn force_shutdown(&mut self);

    fn peer_addr(&self) -> Option<SocketAddr>;

    // descriptor for readiness registration. sockets without one cannot be
    // handed to a selector
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}

pub trait SocketListener: Send + Sync {
    fn accept(&self) -> Result<Box<dyn Socket>, io::Error>;

    fn local_addr(&self) -> Result<SocketAddr, io::Error>;
}

impl Socket for TcpStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), io::Error> {
        // a zero duration is rejected by the OS layer
        let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));

        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_nonblocking(&mut self, nonblocking: bool) -> Result<(), io::Error> {
        TcpStream::set_nonblocking(self, nonblocking)
    }

    fn shutdown_write(&mut self) -> Result<(), io::Error> {
        self.shutdown(Shutdown::Write)
    }

    fn force_shutdown(&mut self) {
        let _ = self.shutdown(Shutdown::Both);
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.as_raw_fd())
    }
}

pub struct TcpSocketListener {
    inner: TcpListener,
}

impl TcpSocketListener {
    pub fn bind(addr: SocketAddr) -> Result<Self, io::Error> {
        let socket = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;

        Ok(Self {
            inner: socket.into(),
        })
    }
}

impl SocketListener for TcpSocketListener {
    fn accept(&self) -> Result<Box<dyn Socket>, io::Error> {
        let (stream, peer) = self.inner.accept()?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("failed to set nodelay for {}: {}", peer, e);
        }

        Ok(Box::new(stream))
    }

    fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.inner.local_addr()
    }
}

pub fn is_timeout(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

// errors meaning the peer went away
pub fn is_client_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}
