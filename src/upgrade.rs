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

//! Comet (suspend/resume) and duplex upgrades of a request.

use crate::connection::Connection;
use crate::core::buffer::ReadBuffer;
use crate::executor::{Scheduler, Task};
use crate::handler::ResumeCause;
use crate::net::Socket;
use log::{debug, error, warn};
use slab::Slab;
use std::any::Any;
use std::cmp;
use std::collections::HashMap;
use std::error::Error;
use std::io::{self, Read, Write};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum UpgradeError {
    #[error("comet is not supported by this engine")]
    CometUnsupported,

    #[error("comet already started for this request")]
    CometAlreadyStarted,
}

pub type ListenerError = Box<dyn Error + Send + Sync>;

/// Notified once when a comet request completes.
pub trait CometListener: Send {
    fn on_complete(&mut self, timed_out: bool) -> Result<(), ListenerError>;
}

impl<F> CometListener for F
where
    F: FnMut(bool) -> Result<(), ListenerError> + Send,
{
    fn on_complete(&mut self, timed_out: bool) -> Result<(), ListenerError> {
        self(timed_out)
    }
}

/// Deadlines of suspended requests.
#[derive(Default)]
pub struct SuspendRegistry {
    entries: Mutex<Slab<(Instant, Weak<CometController>)>>,
}

impl SuspendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, deadline: Instant, controller: Weak<CometController>) -> usize {
        self.entries.lock().unwrap().insert((deadline, controller))
    }

    // keys are reused, so only remove if the entry still belongs to the
    // controller
    fn remove(&self, key: usize, controller: &Weak<CometController>) {
        let entries = &mut *self.entries.lock().unwrap();

        if let Some((_, c)) = entries.get(key) {
            if Weak::ptr_eq(c, controller) {
                entries.remove(key);
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(_, (deadline, _))| *deadline)
            .min()
    }

    fn expire_matching<F>(&self, f: F) -> usize
    where
        F: Fn(Instant) -> bool,
    {
        let expired: Vec<Weak<CometController>> = {
            let entries = &mut *self.entries.lock().unwrap();

            let keys: Vec<usize> = entries
                .iter()
                .filter(|(_, (deadline, _))| f(*deadline))
                .map(|(key, _)| key)
                .collect();

            keys.into_iter().map(|key| entries.remove(key).1).collect()
        };

        let mut count = 0;

        for c in expired {
            if let Some(c) = c.upgrade() {
                c.expire();
                count += 1;
            }
        }

        count
    }

    /// Times out every request whose deadline is at or before `now`.
    /// Returns the number of requests expired.
    pub fn sweep(&self, now: Instant) -> usize {
        self.expire_matching(|deadline| deadline <= now)
    }

    // used at shutdown
    pub fn expire_all(&self) -> usize {
        self.expire_matching(|_| true)
    }
}

/// Engine-side comet facilities. Without one, requests cannot suspend.
pub struct CometSupport {
    scheduler: Arc<dyn Scheduler>,
    registry: SuspendRegistry,
    suspend_time_max: Duration,
}

impl CometSupport {
    pub fn new(scheduler: Arc<dyn Scheduler>, suspend_time_max: Duration) -> Self {
        Self {
            scheduler,
            registry: SuspendRegistry::new(),
            suspend_time_max,
        }
    }

    pub fn registry(&self) -> &SuspendRegistry {
        &self.registry
    }

    pub fn suspend_time_max(&self) -> Duration {
        self.suspend_time_max
    }
}

struct CometInner {
    parked: Option<Box<Connection>>,
    pending: Option<ResumeCause>,
    complete: bool,
    timed_out: bool,
    timeout: Duration,
    registry_key: Option<usize>,
    listeners: Vec<Box<dyn CometListener>>,
    listeners_fired: bool,
}

// a terminal cause is never replaced by a wake
fn merge_cause(pending: &mut Option<ResumeCause>, cause: ResumeCause) {
    let keep = match pending {
        Some(ResumeCause::Complete) | Some(ResumeCause::Timeout) => true,
        Some(ResumeCause::Dispatch(_)) => cause == ResumeCause::Wake,
        _ => false,
    };

    if !keep {
        *pending = Some(cause);
    }
}

/// Handle to a suspended request. Clones may be held by any thread and
/// used to wake, dispatch or complete the request.
pub struct CometController {
    connection_id: u64,
    support: Arc<CometSupport>,
    this: Weak<CometController>,
    inner: Mutex<CometInner>,
    attributes: Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>,
}

impl CometController {
    pub fn new(connection_id: u64, support: Arc<CometSupport>) -> Arc<Self> {
        let timeout = support.suspend_time_max;

        Arc::new_cyclic(|this| Self {
            connection_id,
            support,
            this: this.clone(),
            inner: Mutex::new(CometInner {
                parked: None,
                pending: None,
                complete: false,
                timed_out: false,
                timeout,
                registry_key: None,
                listeners: Vec::new(),
                listeners_fired: false,
            }),
            attributes: Mutex::new(HashMap::new()),
        })
    }

    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    // bounded by the engine's suspend time max. applies to the next suspend
    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.lock().unwrap().timeout = cmp::min(timeout, self.support.suspend_time_max);
    }

    pub fn timeout(&self) -> Duration {
        self.inner.lock().unwrap().timeout
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.lock().unwrap().parked.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.lock().unwrap().complete
    }

    pub fn is_timed_out(&self) -> bool {
        self.inner.lock().unwrap().timed_out
    }

    pub fn add_listener(&self, listener: Box<dyn CometListener>) {
        self.inner.lock().unwrap().listeners.push(listener);
    }

    pub fn set_attribute(&self, name: &str, value: Arc<dyn Any + Send + Sync>) {
        self.attributes
            .lock()
            .unwrap()
            .insert(name.to_string(), value);
    }

    pub fn attribute(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.attributes.lock().unwrap().get(name).cloned()
    }

    pub fn remove_attribute(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.attributes.lock().unwrap().remove(name)
    }

    pub fn attribute_names(&self) -> Vec<String> {
        self.attributes.lock().unwrap().keys().cloned().collect()
    }

    /// Resumes the request so the handler runs again. Returns false if the
    /// request already completed.
    pub fn wake(&self) -> bool {
        self.resume_with(ResumeCause::Wake, false)
    }

    /// Resumes the request with a forward path for the handler.
    pub fn dispatch(&self, path: &str) -> bool {
        self.resume_with(ResumeCause::Dispatch(path.to_string()), false)
    }

    /// Ends the request. The engine finishes the response and notifies the
    /// listeners.
    pub fn complete(&self) -> bool {
        self.resume_with(ResumeCause::Complete, true)
    }

    pub(crate) fn expire(&self) -> bool {
        {
            let inner = &mut *self.inner.lock().unwrap();

            // the sweep already dropped our registry entry
            inner.registry_key = None;

            if inner.complete {
                return false;
            }

            inner.timed_out = true;
        }

        debug!("conn {}: comet timeout", self.connection_id);

        self.resume_with(ResumeCause::Timeout, true)
    }

    // marks the request timed out without resuming, for suspends that were
    // never parked
    pub(crate) fn force_timeout(&self) {
        let inner = &mut *self.inner.lock().unwrap();

        inner.complete = true;
        inner.timed_out = true;
    }

    fn resume_with(&self, cause: ResumeCause, terminal: bool) -> bool {
        let conn = {
            let inner = &mut *self.inner.lock().unwrap();

            if inner.complete && cause != ResumeCause::Timeout {
                return false;
            }

            if terminal {
                inner.complete = true;
            }

            match inner.parked.take() {
                Some(conn) => {
                    if let Some(key) = inner.registry_key.take() {
                        self.support.registry.remove(key, &self.this);
                    }

                    conn
                }
                None => {
                    merge_cause(&mut inner.pending, cause);

                    return true;
                }
            }
        };

        if let Err(task) = self.support.scheduler.schedule(Task::Resume(conn, cause)) {
            warn!(
                "conn {}: unable to schedule comet resume",
                self.connection_id
            );

            task.abort();
        }

        true
    }

    /// Takes ownership of a suspended connection. If a wake arrived before
    /// the connection could be parked, the connection is handed back with
    /// the cause to resume with.
    pub(crate) fn park(&self, conn: Box<Connection>) -> Option<(Box<Connection>, ResumeCause)> {
        let inner = &mut *self.inner.lock().unwrap();

        if let Some(cause) = inner.pending.take() {
            return Some((conn, cause));
        }

        let deadline = Instant::now() + inner.timeout;

        inner.registry_key = Some(self.support.registry.insert(deadline, self.this.clone()));
        inner.parked = Some(conn);

        None
    }

    // drops any remembered wake, e.g. once the handler chose to complete
    pub(crate) fn take_pending(&self) -> Option<ResumeCause> {
        self.inner.lock().unwrap().pending.take()
    }

    pub(crate) fn mark_complete(&self) {
        self.inner.lock().unwrap().complete = true;
    }

    /// Runs each listener once, in registration order. Listener failures
    /// are logged and never stop the sequence.
    pub(crate) fn fire_listeners(&self) {
        let (mut listeners, timed_out) = {
            let inner = &mut *self.inner.lock().unwrap();

            if inner.listeners_fired {
                return;
            }

            inner.listeners_fired = true;

            (mem::take(&mut inner.listeners), inner.timed_out)
        };

        for (i, l) in listeners.iter_mut().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| l.on_complete(timed_out))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(
                    "conn {}: comet listener {} failed: {}",
                    self.connection_id, i, e
                ),
                Err(_) => error!(
                    "conn {}: comet listener {} panicked",
                    self.connection_id, i
                ),
            }
        }
    }
}

/// Protocol handler for an upgraded connection.
pub trait DuplexHandler: Send {
    fn on_start(&mut self, _io: &mut DuplexIo) -> Result<(), io::Error> {
        Ok(())
    }

    /// Called when input is available. Returning false closes the connection.
    fn on_read(&mut self, io: &mut DuplexIo) -> Result<bool, io::Error>;

    fn on_close(&mut self) {}
}

/// Raw access to an upgraded connection.
pub struct DuplexIo<'a> {
    rbuf: &'a mut ReadBuffer,
    sock: &'a mut dyn Socket,
}

impl<'a> DuplexIo<'a> {
    pub(crate) fn new(rbuf: &'a mut ReadBuffer, sock: &'a mut dyn Socket) -> Self {
        Self { rbuf, sock }
    }

    // bytes readable without touching the socket
    pub fn available(&self) -> usize {
        self.rbuf.read_avail()
    }

    // total bytes consumed on this connection
    pub fn position(&self) -> u64 {
        self.rbuf.position()
    }

    pub fn buffered(&self) -> &[u8] {
        self.rbuf.read_buf()
    }

    pub fn consume(&mut self, amount: usize) {
        self.rbuf.read_commit(amount);
    }
}

impl Read for DuplexIo<'_> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, io::Error> {
        if buf.is_empty() {
            return Ok(0);
        }

        if self.rbuf.read_avail() == 0 && self.rbuf.fill_from(self.sock)? == 0 {
            return Ok(0);
        }

        Ok(self.rbuf.take_into(buf))
    }
}

impl Write for DuplexIo<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        self.sock.write(buf)
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        self.sock.flush()
    }
}
