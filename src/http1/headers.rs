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

use std::str;

/// Ordered list of header fields with case-insensitive names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderList {
    entries: Vec<(String, String)>,
}

impl HeaderList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    // replaces the last entry named `name` and drops earlier duplicates
    pub fn set(&mut self, name: &str, value: &str) {
        let mut found = false;

        for i in (0..self.entries.len()).rev() {
            if !self.entries[i].0.eq_ignore_ascii_case(name) {
                continue;
            }

            if found {
                self.entries.remove(i);
            } else {
                self.entries[i].1 = value.to_string();
                found = true;
            }
        }

        if !found {
            self.add(name, value);
        }
    }

    pub fn add(&mut self, name: &str, value: &str) {
        self.entries.push((name.to_string(), value.to_string()));
    }

    // returns true if anything was removed
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(name));

        self.entries.len() != before
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

// true if the comma-separated value list contains param, ignoring case
pub fn header_contains_param(value: &[u8], param: &str) -> bool {
    for part in value.split(|b| *b == b',') {
        let part = match str::from_utf8(part) {
            Ok(part) => part,
            Err(_) => continue,
        };

        if part.trim().eq_ignore_ascii_case(param) {
            return true;
        }
    }

    false
}

// extracts the charset parameter of a content type, if any
pub fn content_type_charset(content_type: &str) -> Option<&str> {
    for param in content_type.split(';').skip(1) {
        let (k, v) = match param.split_once('=') {
            Some(kv) => kv,
            None => continue,
        };

        if k.trim().eq_ignore_ascii_case("charset") {
            return Some(v.trim().trim_matches('"'));
        }
    }

    None
}
