// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sequence-number payload: ASCII `"<node_id>:<pid>:<max_expected>"`.

use std::fmt;
use std::str;

use crate::error::{Error, Result};

/// Parsed conformance payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadTriplet {
    pub node_id: u32,
    pub pid: u64,
    pub max_expected: u64,
}

impl PayloadTriplet {
    /// Parse a payload.
    ///
    /// Trailing NUL bytes and whitespace are ignored; anything else that is
    /// not exactly three colon-separated decimal fields is `MalformedPayload`.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let malformed = || Error::MalformedPayload(String::from_utf8_lossy(payload).into_owned());

        let text = str::from_utf8(payload).map_err(|_| malformed())?;
        let text = text.trim_end_matches(|c: char| c == '\0' || c.is_ascii_whitespace());

        let mut fields = text.split(':');
        let (Some(node_id), Some(pid), Some(max_expected), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(malformed());
        };

        Ok(Self {
            node_id: node_id.parse().map_err(|_| malformed())?,
            pid: pid.parse().map_err(|_| malformed())?,
            max_expected: max_expected.parse().map_err(|_| malformed())?,
        })
    }

    /// Encode as the ASCII payload publishers send.
    #[must_use]
    pub fn to_payload(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for PayloadTriplet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.node_id, self.pid, self.max_expected)
    }
}
