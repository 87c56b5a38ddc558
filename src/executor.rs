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

use crate::connection::{Connection, Engine};
use crate::handler::ResumeCause;
use crate::net::Socket;
use log::{debug, error};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

/// A unit of connection work that can run on any worker.
pub enum Task {
    // a newly accepted socket
    Accept(Arc<Engine>, Box<dyn Socket>),

    // the selector saw input for a connection waiting between requests
    Keepalive(Box<Connection>),

    Resume(Box<Connection>, ResumeCause),

    // the selector saw input for an upgraded connection
    DuplexRead(Box<Connection>),
}

impl Task {
    pub fn run(self) {
        let id = match &self {
            // serve contains its own panics
            Self::Accept(_, _) => None,
            Self::Keepalive(c) | Self::Resume(c, _) | Self::DuplexRead(c) => Some(c.id()),
        };

        // the connection is dropped during unwinding, which destroys it
        let result = panic::catch_unwind(AssertUnwindSafe(move || match self {
            Self::Accept(engine, sock) => engine.serve(sock),
            Self::Keepalive(c) => c.run_keepalive(),
            Self::Resume(c, cause) => c.run_resume(cause),
            Self::DuplexRead(c) => c.run_duplex(),
        }));

        if result.is_err() {
            match id {
                Some(id) => error!("conn {}: task panicked, connection destroyed", id),
                None => error!("accept task panicked"),
            }
        }
    }

    // for tasks that can no longer be scheduled
    pub fn abort(self) {
        match self {
            Self::Accept(_, mut sock) => sock.force_shutdown(),
            Self::Keepalive(c) | Self::Resume(c, _) | Self::DuplexRead(c) => c.destroy(),
        }
    }
}

pub trait Scheduler: Send + Sync {
    /// Queues a task. After shutdown the task is handed back.
    fn schedule(&self, task: Task) -> Result<(), Task>;
}

/// Fixed set of worker threads pulling tasks from a shared queue.
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self, io::Error> {
        let (s, r) = mpsc::channel::<Task>();
        let r = Arc::new(Mutex::new(r));

        let mut threads = Vec::with_capacity(workers);

        for id in 0..workers {
            let r = Arc::clone(&r);

            let thread = thread::Builder::new()
                .name(format!("worker-{}", id))
                .spawn(move || {
                    debug!("worker {}: starting", id);

                    loop {
                        // hold the lock only while waiting
                        let task = {
                            let r = r.lock().unwrap();

                            r.recv()
                        };

                        match task {
                            Ok(task) => task.run(),
                            Err(_) => break,
                        }
                    }

                    debug!("worker {}: stopped", id);
                })?;

            threads.push(thread);
        }

        Ok(Self {
            sender: Mutex::new(Some(s)),
            threads: Mutex::new(threads),
        })
    }

    pub fn is_running(&self) -> bool {
        self.sender.lock().unwrap().is_some()
    }

    /// Stops accepting tasks, lets queued tasks finish and joins the
    /// workers.
    pub fn shutdown(&self) {
        let sender = self.sender.lock().unwrap().take();

        if sender.is_none() {
            return;
        }

        drop(sender);

        let threads: Vec<_> = self.threads.lock().unwrap().drain(..).collect();

        for thread in threads {
            if thread.thread().id() == thread::current().id() {
                continue;
            }

            if thread.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Scheduler for WorkerPool {
    fn schedule(&self, task: Task) -> Result<(), Task> {
        let sender = self.sender.lock().unwrap();

        match &*sender {
            Some(s) => s.send(task).map_err(|mpsc::SendError(task)| task),
            None => Err(task),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
pub mod test {
    use super::*;

    /// Runs tasks on the calling thread.
    pub struct ImmediateScheduler;

    impl Scheduler for ImmediateScheduler {
        fn schedule(&self, task: Task) -> Result<(), Task> {
            task.run();

            Ok(())
        }
    }

    /// Refuses everything.
    pub struct ClosedScheduler;

    impl Scheduler for ClosedScheduler {
        fn schedule(&self, task: Task) -> Result<(), Task> {
            Err(task)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::EngineConfig;
    use crate::handler::{Exchange, FnHandler, HandlerError};
    use crate::net::test::MemorySocket;
    use crate::port::test::RecordingAccounting;
    use std::time::Duration;

    fn engine(port: &Arc<RecordingAccounting>) -> Arc<Engine> {
        let config = EngineConfig {
            keepalive_timeout: Duration::from_millis(10),
            select_enabled: false,
            server_header: None,
            ..Default::default()
        };

        let handler = FnHandler(|ex: &mut Exchange| -> Result<(), HandlerError> {
            ex.set_content_length(2);
            ex.print("ok")?;

            Ok(())
        });

        Arc::new(Engine::new(config, Arc::new(handler), port.clone()))
    }

    #[test]
    fn test_worker_pool() {
        let port = Arc::new(RecordingAccounting::new());
        let engine = engine(&port);

        let pool = WorkerPool::new(2).unwrap();
        assert!(pool.is_running());

        let socks: Vec<MemorySocket> = (0..4)
            .map(|_| MemorySocket::with_input(&[b"GET / HTTP/1.1\r\n\r\n"]))
            .collect();

        for sock in socks.iter() {
            let task = Task::Accept(Arc::clone(&engine), Box::new(sock.clone()));

            assert!(pool.schedule(task).is_ok());
        }

        // queued tasks run to completion before the workers exit
        pool.shutdown();
        assert!(!pool.is_running());

        for sock in socks.iter() {
            assert!(sock.output_string().ends_with("\r\n\r\nok"));
        }

        assert_eq!(port.count("connection_open"), 4);
        assert_eq!(port.count("connection_close"), 4);
    }

    #[test]
    fn test_schedule_after_shutdown() {
        let port = Arc::new(RecordingAccounting::new());
        let engine = engine(&port);

        let pool = WorkerPool::new(1).unwrap();
        pool.shutdown();

        // idempotent
        pool.shutdown();

        let sock = MemorySocket::new();

        let task = match pool.schedule(Task::Accept(engine, Box::new(sock.clone()))) {
            Ok(()) => panic!("scheduled after shutdown"),
            Err(task) => task,
        };

        task.abort();

        assert!(sock.is_force_shutdown());
        assert!(sock.output().is_empty());
    }
}
