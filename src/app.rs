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

use crate::core::config::Settings;
use crate::handler::Handler;
use crate::server::{Server, ServerConfig};
use log::info;
use signal_hook;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::iterator::Signals;
use std::error::Error;
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub struct App {
    _server: Server,
}

impl App {
    pub fn new(settings: &Settings, handler: Arc<dyn Handler>) -> Result<Self, Box<dyn Error>> {
        let config = ServerConfig::from_settings(settings)?;

        if let Some(name) = &config.engine.server_header {
            info!("server header: {}", name);
        }

        info!(
            "using {} accept threads, {} workers",
            config.accept_threads, config.workers
        );

        let server = Server::start(config, handler)?;

        Ok(Self { _server: server })
    }

    pub fn wait_for_term(&self) -> Result<(), io::Error> {
        let mut signals = Signals::new(TERM_SIGNALS)?;

        let term_now = Arc::new(AtomicBool::new(false));

        // ensure two term signals in a row causes the app to immediately exit
        for signal_type in TERM_SIGNALS {
            signal_hook::flag::register_conditional_shutdown(
                *signal_type,
                1, // exit code
                Arc::clone(&term_now),
            )?;

            signal_hook::flag::register(*signal_type, Arc::clone(&term_now))?;
        }

        // wait for termination
        for signal in &mut signals {
            if TERM_SIGNALS.contains(&signal) {
                break;
            }
        }

        Ok(())
    }
}
