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

use crate::connection::Engine;
use crate::core::config::{EngineConfig, Settings};
use crate::executor::{Scheduler, Task, WorkerPool};
use crate::handler::Handler;
use crate::net::{Socket, SocketListener, TcpSocketListener};
use crate::port::{Accounting, Port, PortLimits, PortStats};
use crate::selector::{PollSelector, Selector};
use crate::upgrade::CometSupport;
use log::{debug, error, info, warn};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);
const WAKE_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const SUSPEND_TIMER_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("{0}")]
    Config(String),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub accept_threads: usize,
    pub workers: usize,
    pub engine: EngineConfig,
}

impl ServerConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, ServerError> {
        settings
            .validate()
            .map_err(|e| ServerError::Config(e.to_string()))?;

        let listen = settings
            .listen_addr()
            .map_err(|e| ServerError::Config(e.to_string()))?;

        Ok(Self {
            listen,
            accept_threads: settings.server.accept_threads,
            workers: settings.server.workers,
            engine: settings.engine_config(),
        })
    }
}

// expires suspended requests whose time is up
struct SuspendTimer {
    thread: Option<thread::JoinHandle<()>>,
    stop: Option<mpsc::Sender<()>>,
}

impl SuspendTimer {
    fn new(comet: Arc<CometSupport>) -> Result<Self, io::Error> {
        let (s, r) = mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("suspend-timer".to_string())
            .spawn(move || loop {
                let now = Instant::now();

                let wait = match comet.registry().next_deadline() {
                    Some(d) => d.saturating_duration_since(now).min(SUSPEND_TIMER_INTERVAL),
                    None => SUSPEND_TIMER_INTERVAL,
                };

                match r.recv_timeout(wait) {
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        let expired = comet.registry().sweep(Instant::now());

                        if expired > 0 {
                            debug!("suspend timer: expired {} requests", expired);
                        }
                    }
                    _ => break,
                }
            })?;

        Ok(Self {
            thread: Some(thread),
            stop: Some(s),
        })
    }
}

impl Drop for SuspendTimer {
    fn drop(&mut self) {
        // dropping the sender ends the loop
        self.stop = None;

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("suspend timer thread panicked");
            }
        }
    }
}

fn accept_loop(
    id: usize,
    listener: Arc<dyn SocketListener>,
    port: Arc<Port>,
    engine: Arc<Engine>,
    workers: Arc<WorkerPool>,
) {
    debug!("accept {}: starting", id);

    loop {
        match listener.accept() {
            Ok(mut sock) => {
                if port.is_closed() {
                    sock.force_shutdown();
                    break;
                }

                if let Err(task) = workers.schedule(Task::Accept(Arc::clone(&engine), sock)) {
                    warn!("accept {}: unable to schedule connection", id);

                    task.abort();
                }
            }
            Err(e) => {
                if port.is_closed() {
                    break;
                }

                error!("accept {}: {}", id, e);

                thread::sleep(ACCEPT_ERROR_BACKOFF);
            }
        }
    }

    debug!("accept {}: stopped", id);
}

// unblocks one acceptor waiting in accept
fn wake_acceptor(addr: SocketAddr) {
    let ip = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };

    if let Err(e) = TcpStream::connect_timeout(&SocketAddr::new(ip, addr.port()), WAKE_CONNECT_TIMEOUT) {
        warn!("failed to wake acceptor: {}", e);
    }
}

/// A listening HTTP server with its worker, selector and timer threads.
pub struct Server {
    local_addr: SocketAddr,
    port: Arc<Port>,
    engine: Arc<Engine>,
    workers: Arc<WorkerPool>,
    selector: Option<Arc<PollSelector>>,
    comet: Arc<CometSupport>,
    acceptors: Vec<thread::JoinHandle<()>>,
    timer: Option<SuspendTimer>,
    stopped: bool,
}

impl Server {
    pub fn start(config: ServerConfig, handler: Arc<dyn Handler>) -> Result<Self, ServerError> {
        if config.accept_threads == 0 || config.workers == 0 {
            return Err(ServerError::Config(
                "accept_threads and workers must be at least 1".to_string(),
            ));
        }

        let listener = TcpSocketListener::bind(config.listen)?;
        let local_addr = listener.local_addr()?;

        let listener: Arc<dyn SocketListener> = Arc::new(listener);

        let port = Arc::new(Port::new(PortLimits::from_config(&config.engine)));

        let workers = Arc::new(WorkerPool::new(config.workers)?);

        let selector = if config.engine.select_enabled {
            let scheduler: Arc<dyn Scheduler> = workers.clone();

            Some(Arc::new(PollSelector::new(scheduler, config.engine.select_max)?))
        } else {
            None
        };

        let comet = Arc::new(CometSupport::new(
            workers.clone(),
            config.engine.suspend_time_max,
        ));

        let accounting: Arc<dyn Accounting> = port.clone();

        let mut engine = Engine::new(config.engine, handler, accounting).with_comet(comet.clone());

        if let Some(s) = &selector {
            let s: Arc<dyn Selector> = s.clone();

            engine = engine.with_selector(s);
        }

        let engine = Arc::new(engine);

        let timer = SuspendTimer::new(comet.clone())?;

        let mut server = Self {
            local_addr,
            port,
            engine,
            workers,
            selector,
            comet,
            acceptors: Vec::with_capacity(config.accept_threads),
            timer: Some(timer),
            stopped: false,
        };

        for id in 0..config.accept_threads {
            let listener = Arc::clone(&listener);
            let port = Arc::clone(&server.port);
            let engine = Arc::clone(&server.engine);
            let workers = Arc::clone(&server.workers);

            let thread = thread::Builder::new()
                .name(format!("accept-{}", id))
                .spawn(move || accept_loop(id, listener, port, engine, workers));

            match thread {
                Ok(thread) => server.acceptors.push(thread),
                Err(e) => {
                    // unwinds the threads started so far
                    server.stop();

                    return Err(e.into());
                }
            }
        }

        info!("listening on {}", local_addr);

        Ok(server)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> PortStats {
        self.port.stats()
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Stops accepting, expires suspended requests, closes idle
    /// connections and waits for in-flight requests to finish.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }

        self.stopped = true;

        debug!("server stopping");

        self.port.close();

        for _ in 0..self.acceptors.len() {
            wake_acceptor(self.local_addr);
        }

        for thread in self.acceptors.drain(..) {
            if thread.join().is_err() {
                error!("accept thread panicked");
            }
        }

        let expired = self.comet.registry().expire_all();

        if expired > 0 {
            debug!("expired {} suspended requests", expired);
        }

        self.timer = None;

        if let Some(s) = &self.selector {
            s.close();
        }

        self.workers.shutdown();

        debug!("server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
