// Copyright 2020 The xi-editor Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Parsing of NA address strings.
//!
//! Grammar: `[<class> "+"] <protocol> ["://" [<host>]]`
//!
//! Ported from the logic in `na_info_parse()`: split on the first `:` to
//! separate `class+protocol` from the optional `//host` suffix, then
//! split the left side on the first `+` if present.

use crate::error::{NaError, NaResult};

/// The three optional parts recovered from an address string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    pub class_name: Option<String>,
    pub protocol_name: String,
    pub host_name: Option<String>,
}

impl AddrInfo {
    /// Parses a string of the form `[<class>+]<protocol>[://[<host>]]`.
    pub fn parse(info_string: &str) -> NaResult<Self> {
        if info_string.is_empty() {
            return Err(NaError::InvalidParam);
        }

        let (head, locator) = match info_string.split_once(':') {
            Some((h, rest)) => (h, Some(rest)),
            None => (info_string, None),
        };

        let (class_name, protocol_name) = match head.split_once('+') {
            Some((class, proto)) => (Some(class.to_string()), proto.to_string()),
            None => (None, head.to_string()),
        };

        if protocol_name.is_empty() {
            return Err(NaError::ProtocolError);
        }

        let host_name = match locator {
            None => None,
            Some("") => None,
            Some(rest) => {
                if !rest.starts_with("//") {
                    return Err(NaError::ProtocolError);
                }
                let host = &rest[2..];
                if host.is_empty() {
                    None
                } else {
                    Some(host.to_string())
                }
            }
        };

        Ok(AddrInfo { class_name, protocol_name, host_name })
    }

    /// Strips a leading `class+` prefix, for delegating a still-prefixed
    /// string down into a plugin that only expects `protocol[://host]`.
    pub fn strip_class_prefix(info_string: &str) -> &str {
        // The class delimiter only counts if it appears before any "://".
        let scheme_at = info_string.find("://").unwrap_or(usize::MAX);
        match info_string.find('+') {
            Some(plus) if plus < scheme_at => &info_string[plus + 1..],
            _ => info_string,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_class_protocol_host() {
        let info = AddrInfo::parse("sm+tcp://localhost:1234").unwrap();
        assert_eq!(info.class_name.as_deref(), Some("sm"));
        assert_eq!(info.protocol_name, "tcp");
        assert_eq!(info.host_name.as_deref(), Some("localhost:1234"));
    }

    #[test]
    fn parses_protocol_only() {
        let info = AddrInfo::parse("tcp").unwrap();
        assert_eq!(info.class_name, None);
        assert_eq!(info.protocol_name, "tcp");
        assert_eq!(info.host_name, None);
    }

    #[test]
    fn parses_empty_host_after_scheme() {
        let info = AddrInfo::parse("tcp://").unwrap();
        assert_eq!(info.host_name, None);
    }

    #[test]
    fn rejects_malformed_scheme() {
        assert_eq!(AddrInfo::parse("tcp:/localhost").unwrap_err(), NaError::ProtocolError);
    }

    #[test]
    fn rejects_empty_string() {
        assert_eq!(AddrInfo::parse("").unwrap_err(), NaError::InvalidParam);
    }

    #[test]
    fn strips_class_prefix() {
        assert_eq!(AddrInfo::strip_class_prefix("sm+tcp://host"), "tcp://host");
        assert_eq!(AddrInfo::strip_class_prefix("tcp://host"), "tcp://host");
    }
}
