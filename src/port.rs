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

use crate::core::config::EngineConfig;
use log::debug;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Global budget for connections, keepalive waits and suspended requests.
///
/// Implementations are shared by every connection and must tolerate
/// concurrent increments and decrements.
pub trait Accounting: Send + Sync {
    fn is_closed(&self) -> bool;

    /// Whether a connection accepted at `connection_start` may be reused
    /// for another request.
    fn is_keepalive_allowed(&self, connection_start: Instant) -> bool;

    /// Reserves a keepalive slot. Returns false if the budget is exhausted.
    fn keepalive_begin(&self, connection_start: Instant) -> bool;

    fn keepalive_end(&self);

    fn duplex_keepalive_begin(&self);

    fn duplex_keepalive_end(&self);

    fn is_suspend_allowed(&self) -> bool;

    fn comet_suspend(&self);

    fn comet_detach(&self);

    /// Reserves a connection slot for a newly accepted socket.
    fn connection_open(&self) -> bool;

    fn connection_close(&self);

    fn client_disconnect(&self);

    fn request_complete(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLimits {
    pub connection_max: usize,
    pub keepalive_max: usize,
    pub keepalive_time_max: Duration,
    pub suspend_max: usize,
}

impl PortLimits {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            connection_max: config.connection_max,
            keepalive_max: config.keepalive_max,
            keepalive_time_max: config.keepalive_time_max,
            suspend_max: config.suspend_max,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PortStats {
    pub connections: usize,
    pub keepalive: usize,
    pub duplex_keepalive: usize,
    pub suspended: usize,
    pub requests: usize,
    pub client_disconnects: usize,
}

pub struct Port {
    limits: PortLimits,
    closed: AtomicBool,
    connections: AtomicUsize,
    keepalive: AtomicUsize,
    duplex_keepalive: AtomicUsize,
    suspended: AtomicUsize,
    requests: AtomicUsize,
    client_disconnects: AtomicUsize,
}

// increments counter if it is below max
fn try_acquire(counter: &AtomicUsize, max: usize) -> bool {
    counter
        .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
            if v < max {
                Some(v + 1)
            } else {
                None
            }
        })
        .is_ok()
}

fn release(counter: &AtomicUsize) {
    // never wrap below zero
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
}

impl Port {
    pub fn new(limits: PortLimits) -> Self {
        Self {
            limits,
            closed: AtomicBool::new(false),
            connections: AtomicUsize::new(0),
            keepalive: AtomicUsize::new(0),
            duplex_keepalive: AtomicUsize::new(0),
            suspended: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
            client_disconnects: AtomicUsize::new(0),
        }
    }

    pub fn limits(&self) -> &PortLimits {
        &self.limits
    }

    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("port closed");
        }
    }

    pub fn stats(&self) -> PortStats {
        PortStats {
            connections: self.connections.load(Ordering::Relaxed),
            keepalive: self.keepalive.load(Ordering::Relaxed),
            duplex_keepalive: self.duplex_keepalive.load(Ordering::Relaxed),
            suspended: self.suspended.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            client_disconnects: self.client_disconnects.load(Ordering::Relaxed),
        }
    }
}

impl Accounting for Port {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn is_keepalive_allowed(&self, connection_start: Instant) -> bool {
        if self.is_closed() {
            return false;
        }

        if connection_start.elapsed() >= self.limits.keepalive_time_max {
            return false;
        }

        self.keepalive.load(Ordering::Acquire) < self.limits.keepalive_max
    }

    fn keepalive_begin(&self, connection_start: Instant) -> bool {
        if self.is_closed() || connection_start.elapsed() >= self.limits.keepalive_time_max {
            return false;
        }

        try_acquire(&self.keepalive, self.limits.keepalive_max)
    }

    fn keepalive_end(&self) {
        release(&self.keepalive);
    }

    fn duplex_keepalive_begin(&self) {
        self.duplex_keepalive.fetch_add(1, Ordering::AcqRel);
    }

    fn duplex_keepalive_end(&self) {
        release(&self.duplex_keepalive);
    }

    fn is_suspend_allowed(&self) -> bool {
        !self.is_closed() && self.suspended.load(Ordering::Acquire) < self.limits.suspend_max
    }

    fn comet_suspend(&self) {
        self.suspended.fetch_add(1, Ordering::AcqRel);
    }

    fn comet_detach(&self) {
        release(&self.suspended);
    }

    fn connection_open(&self) -> bool {
        !self.is_closed() && try_acquire(&self.connections, self.limits.connection_max)
    }

    fn connection_close(&self) {
        release(&self.connections);
    }

    fn client_disconnect(&self) {
        self.client_disconnects.fetch_add(1, Ordering::Relaxed);
    }

    fn request_complete(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }
}
