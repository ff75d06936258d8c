// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Session identifiers.
//!
//! Clients address statements to `/v1/sessions/{session_id}/statements`. The
//! gateway keeps no state between requests, so a session is only a partition
//! key: it names the scratch subdirectory that holds the session's scripts and
//! it tags every log line emitted on the session's behalf.

use std::fmt;
use std::str::FromStr;

use crate::error::StatementError;

/// The longest session identifier the gateway accepts.
pub const MAX_SESSION_ID_LEN: usize = 128;

/// A validated session identifier.
///
/// Valid identifiers are non-empty, at most [`MAX_SESSION_ID_LEN`] bytes, and
/// consist solely of ASCII letters, digits, `_`, `-` and `.`. The names `.`
/// and `..` are rejected so that an identifier can always be used as a single
/// path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for SessionId {
    type Err = StatementError;

    fn from_str(s: &str) -> Result<SessionId, StatementError> {
        if s.is_empty() {
            return Err(StatementError::Validation(
                "session id must not be empty".into(),
            ));
        }
        if s.len() > MAX_SESSION_ID_LEN {
            return Err(StatementError::Validation(format!(
                "session id must be at most {MAX_SESSION_ID_LEN} bytes long"
            )));
        }
        if s == "." || s == ".." {
            return Err(StatementError::Validation(format!(
                "invalid session id {s:?}"
            )));
        }
        if let Some(c) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
        {
            return Err(StatementError::Validation(format!(
                "invalid character {c:?} in session id"
            )));
        }
        Ok(SessionId(s.to_string()))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}
