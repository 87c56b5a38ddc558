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

use clap::Parser;
use httplink::core::config::{get_config_file, Settings};
use httplink::core::log::{
    ensure_init_simple_logger, get_simple_logger, level_filter, local_offset_check, open_log_file,
};
use httplink::handler::{Disposition, Exchange, Handler, HandlerError, ResumeCause};
use log::{error, info};
use std::env;
use std::error::Error;
use std::io::Read;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const WAIT_TIME: Duration = Duration::from_secs(2);
const STREAM_CHUNKS: usize = 5;

#[derive(Parser, Clone)]
#[command(name = "httplink", version, about = "HTTP/1.x connection engine.")]
struct CliArgs {
    #[arg(short, long, value_name = "file", help = "Config file.")]
    config_file: Option<PathBuf>,

    #[arg(short, long, value_name = "file", help = "File to log to.")]
    log_file: Option<PathBuf>,

    #[arg(
        short = 'L',
        long,
        value_name = "x",
        value_parser = clap::value_parser!(u8).range(0..=4),
        help = "Log level, 0-4 (default: from config)."
    )]
    log_level: Option<u8>,

    #[arg(long, value_name = "addr:port", help = "Address to listen on.")]
    listen: Option<String>,
}

// routes used to try out the engine by hand
struct DemoHandler;

impl Handler for DemoHandler {
    fn handle(&self, ex: &mut Exchange) -> Result<Disposition, HandlerError> {
        match (ex.method(), ex.path()) {
            ("POST", _) => {
                let mut body = Vec::new();
                ex.input_stream()?.read_to_end(&mut body)?;

                ex.set_content_type("application/octet-stream");
                ex.set_content_length(body.len() as u64);
                ex.write(&body)?;
            }
            (_, "/stream") => {
                ex.set_content_type("text/plain");

                for i in 0..STREAM_CHUNKS {
                    ex.print(&format!("chunk {}\n", i))?;
                    ex.flush()?;
                }
            }
            (_, "/wait") => {
                let c = ex.start_comet()?;

                thread::spawn(move || {
                    thread::sleep(WAIT_TIME);

                    c.wake();
                });

                return Ok(Disposition::Suspend);
            }
            _ => {
                let body = format!("hello from {}\n", ex.path());

                ex.set_content_type("text/plain");
                ex.set_content_length(body.len() as u64);
                ex.print(&body)?;
            }
        }

        Ok(Disposition::Complete)
    }

    fn resume(&self, ex: &mut Exchange, cause: &ResumeCause) -> Result<Disposition, HandlerError> {
        let body = match cause {
            ResumeCause::Timeout => "timed out\n",
            _ => "done waiting\n",
        };

        ex.set_content_type("text/plain");
        ex.set_content_length(body.len() as u64);
        ex.print(body)?;

        Ok(Disposition::Complete)
    }
}

fn process_args_and_run(args: CliArgs) -> Result<(), Box<dyn Error>> {
    let config_file = get_config_file(&env::current_dir()?, args.config_file)?;

    let mut settings = Settings::new(config_file.as_deref())?;

    if let Some(listen) = args.listen {
        settings.server.listen = listen;
    }

    settings.validate()?;

    let log_file = match &args.log_file {
        Some(x) => match open_log_file(x) {
            Ok(x) => Some(x),
            Err(_) => {
                error!("unable to open log file. logging to standard out.");
                None
            }
        },
        None => None,
    };
    ensure_init_simple_logger(log_file);
    log::set_logger(get_simple_logger()).unwrap();

    let level = args.log_level.unwrap_or(settings.server.log_level);
    log::set_max_level(level_filter(level));

    local_offset_check();

    match &config_file {
        Some(f) => info!("using config: {}", f.display()),
        None => info!("no config file found, using defaults"),
    }

    httplink::run(&settings, Arc::new(DemoHandler))
}

fn main() {
    let args = CliArgs::parse();

    if let Err(e) = process_args_and_run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
