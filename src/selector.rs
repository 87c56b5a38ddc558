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

//! Parking of idle connections until their socket becomes readable.

use crate::connection::Connection;
use crate::executor::{Scheduler, Task};
use log::{debug, error, warn};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const EVENTS_MAX: usize = 1024;
const WAKER_TOKEN: Token = Token(0);

// how often parked connections are checked for keepalive timeout
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

pub trait Selector: Send + Sync {
    /// Takes ownership of an idle connection. The connection is handed back
    /// if it cannot be registered.
    fn keepalive(&self, conn: Box<Connection>) -> Result<(), Box<Connection>>;

    /// Closes every parked connection and refuses new ones.
    fn close(&self);
}

struct Parked {
    conn: Box<Connection>,
    since: Instant,
}

struct SelectorThread {
    poll: Poll,
    inbox: mpsc::Receiver<Box<Connection>>,
    scheduler: Arc<dyn Scheduler>,
    count: Arc<AtomicUsize>,
    parked: Slab<Parked>,
}

impl SelectorThread {
    fn run(mut self) {
        let mut events = Events::with_capacity(EVENTS_MAX);

        loop {
            loop {
                match self.inbox.try_recv() {
                    Ok(conn) => self.register(conn),
                    Err(mpsc::TryRecvError::Empty) => break,
                    Err(mpsc::TryRecvError::Disconnected) => {
                        self.close_all();

                        return;
                    }
                }
            }

            if let Err(e) = self.poll.poll(&mut events, Some(SWEEP_INTERVAL)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }

                error!("selector poll failed: {}", e);

                self.close_all();

                return;
            }

            for event in events.iter() {
                if event.token() == WAKER_TOKEN {
                    continue;
                }

                let key = event.token().0 - 1;

                if !self.parked.contains(key) {
                    continue;
                }

                let conn = self.unregister(key);
                let id = conn.id();

                let task = if conn.is_duplex() {
                    Task::DuplexRead(conn)
                } else {
                    Task::Keepalive(conn)
                };

                if let Err(task) = self.scheduler.schedule(task) {
                    warn!("conn {}: unable to schedule read", id);

                    task.abort();
                }
            }

            self.sweep(Instant::now());
        }
    }

    fn register(&mut self, conn: Box<Connection>) {
        let fd = match conn.raw_fd() {
            Some(fd) => fd,
            None => {
                self.count.fetch_sub(1, Ordering::Relaxed);
                conn.close();

                return;
            }
        };

        let entry = self.parked.vacant_entry();
        let token = Token(entry.key() + 1);

        if let Err(e) = self
            .poll
            .registry()
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
        {
            warn!("conn {}: selector register failed: {}", conn.id(), e);

            self.count.fetch_sub(1, Ordering::Relaxed);
            conn.close();

            return;
        }

        entry.insert(Parked {
            conn,
            since: Instant::now(),
        });
    }

    fn unregister(&mut self, key: usize) -> Box<Connection> {
        let p = self.parked.remove(key);

        if let Some(fd) = p.conn.raw_fd() {
            if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                debug!("conn {}: selector deregister failed: {}", p.conn.id(), e);
            }
        }

        self.count.fetch_sub(1, Ordering::Relaxed);

        p.conn
    }

    fn sweep(&mut self, now: Instant) {
        let expired: Vec<usize> = self
            .parked
            .iter()
            .filter(|(_, p)| now.duration_since(p.since) >= p.conn.keepalive_timeout())
            .map(|(key, _)| key)
            .collect();

        for key in expired {
            let conn = self.unregister(key);

            debug!("conn {}: keepalive timeout", conn.id());

            conn.close();
        }
    }

    fn close_all(&mut self) {
        let keys: Vec<usize> = self.parked.iter().map(|(key, _)| key).collect();

        for key in keys {
            let conn = self.unregister(key);
            conn.close();
        }

        // registrations that raced with shutdown
        while let Ok(conn) = self.inbox.try_recv() {
            self.count.fetch_sub(1, Ordering::Relaxed);
            conn.close();
        }
    }
}

/// mio based selector running on its own thread.
pub struct PollSelector {
    sender: Mutex<Option<mpsc::Sender<Box<Connection>>>>,
    waker: Waker,
    count: Arc<AtomicUsize>,
    select_max: usize,
    closed: AtomicBool,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl PollSelector {
    pub fn new(scheduler: Arc<dyn Scheduler>, select_max: usize) -> Result<Self, io::Error> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        let (s, r) = mpsc::channel();
        let count = Arc::new(AtomicUsize::new(0));

        let t = SelectorThread {
            poll,
            inbox: r,
            scheduler,
            count: Arc::clone(&count),
            parked: Slab::new(),
        };

        let thread = thread::Builder::new()
            .name("selector".to_string())
            .spawn(move || t.run())?;

        Ok(Self {
            sender: Mutex::new(Some(s)),
            waker,
            count,
            select_max,
            closed: AtomicBool::new(false),
            thread: Mutex::new(Some(thread)),
        })
    }

    // connections currently parked or about to be
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Selector for PollSelector {
    fn keepalive(&self, conn: Box<Connection>) -> Result<(), Box<Connection>> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(conn);
        }

        if self.count.fetch_add(1, Ordering::Relaxed) >= self.select_max {
            self.count.fetch_sub(1, Ordering::Relaxed);

            debug!("conn {}: selector full", conn.id());

            return Err(conn);
        }

        {
            let sender = self.sender.lock().unwrap();

            let result = match &*sender {
                Some(s) => s.send(conn).map_err(|mpsc::SendError(conn)| conn),
                None => Err(conn),
            };

            if let Err(conn) = result {
                self.count.fetch_sub(1, Ordering::Relaxed);

                return Err(conn);
            }
        }

        if let Err(e) = self.waker.wake() {
            error!("selector wake failed: {}", e);
        }

        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }

        // disconnecting the channel stops the thread
        self.sender.lock().unwrap().take();

        if let Err(e) = self.waker.wake() {
            error!("selector wake failed: {}", e);
        }

        if let Some(thread) = self.thread.lock().unwrap().take() {
            // dropped from within the selector thread
            if thread.thread().id() == thread::current().id() {
                return;
            }

            if thread.join().is_err() {
                error!("selector thread panicked");
            }
        }
    }
}

impl Drop for PollSelector {
    fn drop(&mut self) {
        self.close();
    }
}
