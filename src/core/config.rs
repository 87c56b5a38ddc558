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

use crate::core::buffer::{SEGMENT_SIZE_DEFAULT, SEGMENT_SIZE_MAX, SEGMENT_SIZE_MIN};
use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::error::Error;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "httplink.conf";

// safety values
const WORKERS_MAX: usize = 1024;
const ACCEPT_THREADS_MAX: usize = 64;

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerSection {
    pub listen: String,
    pub accept_threads: usize,
    pub workers: usize,
    pub server_header: String,
    pub log_level: u8,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: String::from("0.0.0.0:8080"),
            accept_threads: 1,
            workers: 16,
            server_header: String::new(),
            log_level: 2,
        }
    }
}

impl From<ServerSection> for config::ValueKind {
    fn from(server: ServerSection) -> Self {
        let mut properties = HashMap::new();
        properties.insert("listen".to_string(), config::Value::from(server.listen));
        properties.insert(
            "accept_threads".to_string(),
            config::Value::from(server.accept_threads as i64),
        );
        properties.insert(
            "workers".to_string(),
            config::Value::from(server.workers as i64),
        );
        properties.insert(
            "server_header".to_string(),
            config::Value::from(server.server_header),
        );
        properties.insert(
            "log_level".to_string(),
            config::Value::from(server.log_level as i64),
        );

        Self::Table(properties)
    }
}

// durations are in milliseconds
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct EngineSection {
    pub segment_size: usize,
    pub segment_pool_max: usize,
    pub char_buffer_size: usize,
    pub response_buffer_size: usize,
    pub read_buffer_size: usize,
    pub max_header_size: usize,
    pub body_skip_max: u64,
    pub keepalive_max: usize,
    pub keepalive_timeout: u64,
    pub keepalive_time_max: u64,
    pub connection_max: usize,
    pub connection_pool_max: usize,
    pub select_enabled: bool,
    pub select_max: usize,
    pub suspend_time_max: u64,
    pub suspend_max: usize,
    pub duplex_stall_retry: usize,
    pub socket_timeout: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            segment_size: SEGMENT_SIZE_DEFAULT,
            segment_pool_max: 16384,
            char_buffer_size: 256,
            response_buffer_size: 16384,
            read_buffer_size: 8192,
            max_header_size: 8192,
            body_skip_max: 1024 * 1024,
            keepalive_max: 65536,
            keepalive_timeout: 120_000,
            keepalive_time_max: 600_000,
            connection_max: 1024 * 1024,
            connection_pool_max: 4096,
            select_enabled: true,
            select_max: 65536,
            suspend_time_max: 600_000,
            suspend_max: 65536,
            duplex_stall_retry: 256,
            socket_timeout: 65_000,
        }
    }
}

impl From<EngineSection> for config::ValueKind {
    fn from(engine: EngineSection) -> Self {
        let mut properties = HashMap::new();

        let ints: [(&str, i64); 17] = [
            ("segment_size", engine.segment_size as i64),
            ("segment_pool_max", engine.segment_pool_max as i64),
            ("char_buffer_size", engine.char_buffer_size as i64),
            ("response_buffer_size", engine.response_buffer_size as i64),
            ("read_buffer_size", engine.read_buffer_size as i64),
            ("max_header_size", engine.max_header_size as i64),
            ("body_skip_max", engine.body_skip_max as i64),
            ("keepalive_max", engine.keepalive_max as i64),
            ("keepalive_timeout", engine.keepalive_timeout as i64),
            ("keepalive_time_max", engine.keepalive_time_max as i64),
            ("connection_max", engine.connection_max as i64),
            ("connection_pool_max", engine.connection_pool_max as i64),
            ("select_max", engine.select_max as i64),
            ("suspend_time_max", engine.suspend_time_max as i64),
            ("suspend_max", engine.suspend_max as i64),
            ("duplex_stall_retry", engine.duplex_stall_retry as i64),
            ("socket_timeout", engine.socket_timeout as i64),
        ];

        for (k, v) in ints {
            properties.insert(k.to_string(), config::Value::from(v));
        }

        properties.insert(
            "select_enabled".to_string(),
            config::Value::from(engine.select_enabled),
        );

        Self::Table(properties)
    }
}

#[derive(Debug, Deserialize, Default, Clone, PartialEq, Eq)]
pub struct Settings {
    pub server: ServerSection,
    pub engine: EngineSection,
}

impl Settings {
    // loads the INI file if given, with every key defaulted
    pub fn new(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(f) = config_file {
            builder = builder.add_source(File::from(f).format(config::FileFormat::Ini));
        }

        let config = builder
            .set_default("server", ServerSection::default())?
            .set_default("engine", EngineSection::default())?
            .build()?;

        config.try_deserialize()
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, Box<dyn Error>> {
        let listen = &self.server.listen;

        // a bare port listens on all interfaces
        let addr = if listen.contains(':') {
            listen.clone()
        } else {
            format!("0.0.0.0:{}", listen)
        };

        addr.parse()
            .map_err(|e| format!("failed to parse listen {}: {}", listen, e).into())
    }

    pub fn validate(&self) -> Result<(), Box<dyn Error>> {
        self.listen_addr()?;

        if self.server.workers == 0 || self.server.workers > WORKERS_MAX {
            return Err(format!("workers must be between 1 and {}", WORKERS_MAX).into());
        }

        if self.server.accept_threads == 0 || self.server.accept_threads > ACCEPT_THREADS_MAX {
            return Err(format!(
                "accept_threads must be between 1 and {}",
                ACCEPT_THREADS_MAX
            )
            .into());
        }

        let e = &self.engine;

        if !(SEGMENT_SIZE_MIN..=SEGMENT_SIZE_MAX).contains(&e.segment_size) {
            return Err(format!(
                "segment_size must be between {} and {}",
                SEGMENT_SIZE_MIN, SEGMENT_SIZE_MAX
            )
            .into());
        }

        if e.char_buffer_size == 0 {
            return Err("char_buffer_size must be positive".into());
        }

        if e.read_buffer_size < 512 {
            return Err("read_buffer_size must be at least 512".into());
        }

        if e.max_header_size > e.read_buffer_size {
            return Err("max_header_size cannot exceed read_buffer_size".into());
        }

        if e.duplex_stall_retry == 0 {
            return Err("duplex_stall_retry must be positive".into());
        }

        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        let e = &self.engine;

        let server_header = if self.server.server_header.is_empty() {
            None
        } else {
            Some(self.server.server_header.clone())
        };

        EngineConfig {
            segment_size: e.segment_size,
            segment_pool_max: e.segment_pool_max,
            char_buffer_size: e.char_buffer_size,
            response_buffer_size: e.response_buffer_size,
            read_buffer_size: e.read_buffer_size,
            max_header_size: e.max_header_size,
            body_skip_max: e.body_skip_max,
            keepalive_max: e.keepalive_max,
            keepalive_timeout: Duration::from_millis(e.keepalive_timeout),
            keepalive_time_max: Duration::from_millis(e.keepalive_time_max),
            connection_max: e.connection_max,
            connection_pool_max: e.connection_pool_max,
            select_enabled: e.select_enabled,
            select_max: e.select_max,
            suspend_time_max: Duration::from_millis(e.suspend_time_max),
            suspend_max: e.suspend_max,
            duplex_stall_retry: e.duplex_stall_retry,
            socket_timeout: Duration::from_millis(e.socket_timeout),
            server_header,
        }
    }
}

/// Runtime engine parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub segment_size: usize,
    pub segment_pool_max: usize,
    pub char_buffer_size: usize,
    pub response_buffer_size: usize,
    pub read_buffer_size: usize,
    pub max_header_size: usize,
    pub body_skip_max: u64,
    pub keepalive_max: usize,
    pub keepalive_timeout: Duration,
    pub keepalive_time_max: Duration,
    pub connection_max: usize,
    pub connection_pool_max: usize,
    pub select_enabled: bool,
    pub select_max: usize,
    pub suspend_time_max: Duration,
    pub suspend_max: usize,
    pub duplex_stall_retry: usize,
    pub socket_timeout: Duration,
    pub server_header: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Settings::default().engine_config()
    }
}

pub fn get_config_file(
    work_dir: &Path,
    arg_config: Option<PathBuf>,
) -> Result<Option<PathBuf>, Box<dyn Error>> {
    if let Some(f) = arg_config {
        if f.is_file() {
            return Ok(Some(f));
        }

        return Err(format!("no configuration file found. Tried: {}", f.display()).into());
    }

    let config_files = [
        // ./config
        work_dir.join("config").join(CONFIG_FILE_NAME),
        // current dir
        work_dir.join(CONFIG_FILE_NAME),
    ];

    Ok(config_files.into_iter().find(|f| f.is_file()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("httplink-config-{}-{}", name, std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        dir
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::new(None).unwrap();

        assert_eq!(settings, Settings::default());
        assert!(settings.validate().is_ok());

        let config = settings.engine_config();
        assert_eq!(config.segment_size, 8192);
        assert_eq!(config.keepalive_timeout, Duration::from_secs(120));
        assert_eq!(config.keepalive_time_max, Duration::from_secs(600));
        assert_eq!(config.suspend_time_max, Duration::from_secs(600));
        assert_eq!(config.duplex_stall_retry, 256);
        assert_eq!(config.server_header, None);
    }

    #[test]
    fn test_file_overrides() {
        let dir = temp_dir("overrides");
        let path = dir.join(CONFIG_FILE_NAME);

        fs::write(
            &path,
            "[server]\nlisten=127.0.0.1:9000\nworkers=4\nserver_header=httplink\n\n\
             [engine]\nkeepalive_timeout=5000\nselect_enabled=false\n",
        )
        .unwrap();

        let settings = Settings::new(Some(&path)).unwrap();

        assert_eq!(settings.server.workers, 4);
        assert_eq!(
            settings.listen_addr().unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );

        let config = settings.engine_config();
        assert_eq!(config.keepalive_timeout, Duration::from_secs(5));
        assert!(!config.select_enabled);
        assert_eq!(config.server_header.as_deref(), Some("httplink"));

        // untouched keys keep their defaults
        assert_eq!(config.read_buffer_size, 8192);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_validate() {
        struct Test {
            name: &'static str,
            modify: fn(&mut Settings),
            ok: bool,
        }

        let tests = [
            Test {
                name: "defaults",
                modify: |_| {},
                ok: true,
            },
            Test {
                name: "bare-port",
                modify: |s| s.server.listen = String::from("8000"),
                ok: true,
            },
            Test {
                name: "bad-listen",
                modify: |s| s.server.listen = String::from("nope:x"),
                ok: false,
            },
            Test {
                name: "no-workers",
                modify: |s| s.server.workers = 0,
                ok: false,
            },
            Test {
                name: "segment-too-large",
                modify: |s| s.engine.segment_size = SEGMENT_SIZE_MAX + 1,
                ok: false,
            },
            Test {
                name: "header-larger-than-buffer",
                modify: |s| s.engine.max_header_size = s.engine.read_buffer_size + 1,
                ok: false,
            },
        ];

        for test in tests.iter() {
            let mut settings = Settings::default();
            (test.modify)(&mut settings);

            assert_eq!(settings.validate().is_ok(), test.ok, "test={}", test.name);
        }
    }

    #[test]
    fn test_get_config_file() {
        let dir = temp_dir("find");

        assert_eq!(get_config_file(&dir, None).unwrap(), None);

        let path = dir.join(CONFIG_FILE_NAME);
        fs::write(&path, "[server]\n").unwrap();
        assert_eq!(get_config_file(&dir, None).unwrap(), Some(path.clone()));

        assert_eq!(
            get_config_file(&dir, Some(path.clone())).unwrap(),
            Some(path)
        );

        let e = get_config_file(&dir, Some(PathBuf::from("no/such/file"))).unwrap_err();
        assert_eq!(
            e.to_string(),
            "no configuration file found. Tried: no/such/file"
        );

        fs::remove_dir_all(&dir).unwrap();
    }
}
