/*
 * Copyright (C) 2020-2023 Fanout, Inc.
 * Copyright (C) 2023-2026 Fastly, Inc.
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

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::str;
use std::sync::{Mutex, OnceLock};
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

enum Output<'a> {
    Stdout(io::StdoutLock<'static>),
    File(std::sync::MutexGuard<'a, File>),
}

impl Write for Output<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        match self {
            Self::Stdout(g) => g.write(buf),
            Self::File(g) => g.write(buf),
        }
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        match self {
            Self::Stdout(g) => g.flush(),
            Self::File(g) => g.flush(),
        }
    }
}

pub struct SimpleLogger {
    local_offset: Option<UtcOffset>,
    output_file: Option<Mutex<File>>,
}

impl SimpleLogger {
    fn write_record(&self, record: &Record) -> Result<(), io::Error> {
        let now = OffsetDateTime::now_utc().to_offset(self.local_offset.unwrap_or(UtcOffset::UTC));

        let format = format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
        );

        let mut ts = [0u8; 64];

        let size = {
            let mut ts = io::Cursor::new(&mut ts[..]);

            now.format_into(&mut ts, &format)
                .map_err(|_| io::Error::from(io::ErrorKind::InvalidData))?;

            ts.position() as usize
        };

        let ts = str::from_utf8(&ts[..size]).unwrap_or("");

        let lname = match record.level() {
            Level::Error => "ERR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };

        // hold the lock for the whole line so threads don't interleave
        let mut output = match &self.output_file {
            Some(f) => Output::File(f.lock().unwrap()),
            None => Output::Stdout(io::stdout().lock()),
        };

        if record.level() <= Level::Info {
            writeln!(&mut output, "[{}] {} {}", lname, ts, record.args())
        } else {
            writeln!(
                &mut output,
                "[{}] {} [{}] {}",
                lname,
                ts,
                record.target(),
                record.args()
            )
        }
    }
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // nowhere to report a failure to log
        let _ = self.write_record(record);
    }

    fn flush(&self) {
        if let Some(f) = &self.output_file {
            let _ = f.lock().unwrap().flush();
        }
    }
}

// SAFETY: this method is unsound on platforms where another thread may
// modify environment vars
unsafe fn get_offset() -> Option<UtcOffset> {
    time::util::local_offset::set_soundness(time::util::local_offset::Soundness::Unsound);

    let offset = UtcOffset::current_local_offset().ok();

    time::util::local_offset::set_soundness(time::util::local_offset::Soundness::Sound);

    offset
}

static LOGGER: OnceLock<SimpleLogger> = OnceLock::new();

pub fn ensure_init_simple_logger(output_file: Option<File>) {
    LOGGER.get_or_init(|| {
        // SAFETY: this runs once, before any other threads are started
        let local_offset = unsafe { get_offset() };

        SimpleLogger {
            local_offset,
            output_file: output_file.map(Mutex::new),
        }
    });
}

pub fn get_simple_logger() -> &'static SimpleLogger {
    ensure_init_simple_logger(None);

    // logger is guaranteed to have been initialized
    LOGGER.get().expect("logger should be initialized")
}

pub fn local_offset_check() {
    if get_simple_logger().local_offset.is_none() {
        log::warn!("Failed to determine local time offset. Log timestamps will be in UTC.");
    }
}

pub fn open_log_file(path: &Path) -> Result<File, io::Error> {
    OpenOptions::new().create(true).append(true).open(path)
}

// 0=error, 1=warn, 2=info, 3=debug, 4=trace
pub fn level_filter(level: u8) -> LevelFilter {
    match level {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        4..=u8::MAX => LevelFilter::Trace,
    }
}
