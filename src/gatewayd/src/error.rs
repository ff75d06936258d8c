// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Errors produced while accepting and running a statement.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use http::StatusCode;
use thiserror::Error;
use uuid::Uuid;

use crate::dispatch::CapturedOutput;

/// Everything that can go wrong between accepting a statement and reporting
/// its outcome.
///
/// No variant is ever retried by the gateway. Every variant is reported to the
/// caller synchronously, see [`StatementError::status_code`].
#[derive(Debug, Error)]
pub enum StatementError {
    /// The request was malformed.
    #[error("{0}")]
    Validation(String),
    /// The script file could not be written to the scratch directory.
    #[error("unable to write script file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The SQL client could not be started, or could not be waited on once
    /// started.
    #[error("unable to run sql client {}: {source}", .program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The SQL client ran to completion and reported failure.
    #[error("sql client {}", describe_exit(.exit_code, .signal))]
    Execution {
        script_id: Uuid,
        exit_code: Option<i32>,
        signal: Option<i32>,
        stdout: CapturedOutput,
        stderr: CapturedOutput,
        elapsed: Duration,
    },
    /// The SQL client did not finish before the statement timeout and was
    /// killed.
    #[error("sql client did not finish within {}", fmt_duration(.timeout))]
    Timeout {
        script_id: Uuid,
        timeout: Duration,
        stdout: CapturedOutput,
        stderr: CapturedOutput,
    },
    /// Too many statements were already running.
    #[error(
        "too many statements in flight; no execution slot freed up within {}",
        fmt_duration(.waited)
    )]
    Backpressure { waited: Duration },
    /// The gateway began shutting down before the statement finished. If the
    /// SQL client had been started, it was killed.
    #[error("statement cancelled because the gateway is shutting down")]
    Cancelled { script_id: Option<Uuid> },
}

impl StatementError {
    /// The HTTP status code that reports this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            StatementError::Validation(_) => StatusCode::BAD_REQUEST,
            StatementError::Io { .. }
            | StatementError::Launch { .. }
            | StatementError::Execution { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            StatementError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            StatementError::Backpressure { .. } | StatementError::Cancelled { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    /// A short, stable label for this kind of error, used as a metrics label.
    pub fn outcome(&self) -> &'static str {
        match self {
            StatementError::Validation(_) => "validation",
            StatementError::Io { .. } => "io",
            StatementError::Launch { .. } => "launch",
            StatementError::Execution { .. } => "execution",
            StatementError::Timeout { .. } => "timeout",
            StatementError::Backpressure { .. } => "backpressure",
            StatementError::Cancelled { .. } => "cancelled",
        }
    }
}

fn describe_exit(exit_code: &Option<i32>, signal: &Option<i32>) -> String {
    match (exit_code, signal) {
        (Some(code), _) => format!("exited with code {code}"),
        (None, Some(signal)) => format!("was terminated by signal {signal}"),
        (None, None) => "exited abnormally".into(),
    }
}

fn fmt_duration(duration: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*duration)
}
