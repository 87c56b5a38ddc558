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

use log::warn;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub version: u32,
    pub domain: Option<String>,
    pub path: Option<String>,
}

impl Cookie {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            ..Default::default()
        }
    }
}

// token chars exclude controls, space and the separators below
pub fn is_token_char(c: u8) -> bool {
    if c < 0x20 || c >= 0x7f {
        return false;
    }

    !matches!(c, b' ' | b',' | b';' | b'\\' | b'"' | b'=')
}

fn is_value_char(c: u8) -> bool {
    c == b'=' || is_token_char(c)
}

fn is_separator(c: u8) -> bool {
    matches!(c, b' ' | b'\t' | b';' | b',')
}

/// Parses one Cookie header value, appending to `cookies`.
///
/// `$Version` ahead of the first cookie sets the version of the cookies
/// that follow; `$Version`, `$Domain` and `$Path` after a cookie modify the
/// most recent one. Entries with an empty name are skipped.
pub fn parse_cookies(src: &[u8], cookies: &mut Vec<Cookie>) {
    let first = cookies.len();
    let mut version = 0;
    let mut pos = 0;

    loop {
        while pos < src.len() && is_separator(src[pos]) {
            pos += 1;
        }

        if pos >= src.len() {
            break;
        }

        let is_attr = src[pos] == b'$';
        if is_attr {
            pos += 1;
        }

        let name_start = pos;
        while pos < src.len() && is_token_char(src[pos]) {
            pos += 1;
        }
        let name = &src[name_start..pos];

        while pos < src.len() && (src[pos] == b' ' || src[pos] == b'\t') {
            pos += 1;
        }

        let mut value: &[u8] = b"";

        if pos < src.len() && src[pos] == b'=' {
            pos += 1;

            while pos < src.len() && (src[pos] == b' ' || src[pos] == b'\t') {
                pos += 1;
            }

            if pos < src.len() && src[pos] == b'"' {
                pos += 1;

                let value_start = pos;
                while pos < src.len() && src[pos] != b'"' {
                    pos += 1;
                }
                value = &src[value_start..pos];

                // closing quote
                if pos < src.len() {
                    pos += 1;
                }
            } else {
                let value_start = pos;
                while pos < src.len() && is_value_char(src[pos]) {
                    pos += 1;
                }
                value = &src[value_start..pos];
            }
        }

        if name.is_empty() {
            warn!(
                "bad cookie: {}",
                String::from_utf8_lossy(src).escape_default()
            );

            // resync at the next separator
            while pos < src.len() && src[pos] != b';' && src[pos] != b',' {
                pos += 1;
            }

            continue;
        }

        let name = String::from_utf8_lossy(name);
        let value = String::from_utf8_lossy(value);

        if is_attr {
            let last = if cookies.len() > first {
                cookies.last_mut()
            } else {
                None
            };

            match last {
                Some(cookie) => {
                    if name.eq_ignore_ascii_case("Version") {
                        cookie.version = value.parse().unwrap_or(0);
                    } else if name.eq_ignore_ascii_case("Domain") {
                        cookie.domain = Some(value.into_owned());
                    } else if name.eq_ignore_ascii_case("Path") {
                        cookie.path = Some(value.into_owned());
                    }
                }
                None => {
                    if name.eq_ignore_ascii_case("Version") {
                        version = value.parse().unwrap_or(0);
                    }
                }
            }

            continue;
        }

        cookies.push(Cookie {
            name: name.into_owned(),
            value: value.into_owned(),
            version,
            domain: None,
            path: None,
        });
    }
}
