// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Gateway configuration.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::bail;
use http::HeaderValue;

/// The default port the gateway listens on.
pub const DEFAULT_PORT: u16 = 9000;

/// The default timeout for a single statement.
pub const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(300);

/// The default bound on output captured per stream.
pub const DEFAULT_MAX_OUTPUT_SIZE: usize = 1 << 20;

/// The default bound on the size of a request body.
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 2 << 20;

/// Configuration for a gateway server.
#[derive(Debug, Clone)]
pub struct Config {
    /// The address to listen on.
    pub listen_addr: SocketAddr,
    /// How to run the SQL client.
    pub sql_client: SqlClientConfig,
    /// The directory in which script files are written.
    pub scratch_dir: PathBuf,
    /// The maximum number of statements that may run at once.
    pub max_concurrent_statements: usize,
    /// How long a statement waits for an execution slot before it is
    /// rejected.
    pub admission_timeout: Duration,
    /// The maximum size of a request body, in bytes.
    pub max_request_size: usize,
    /// Origins allowed to make cross-origin requests. `*` allows any origin.
    pub cors_allowed_origins: Vec<HeaderValue>,
}

/// How to run the SQL client.
#[derive(Debug, Clone)]
pub struct SqlClientConfig {
    /// The client executable.
    pub program: PathBuf,
    /// The directory passed to the client with `-l`.
    pub plugin_dir: PathBuf,
    /// How long a single client run may take.
    pub statement_timeout: Duration,
    /// The maximum number of bytes captured from each of the client's output
    /// streams.
    pub max_output_size: usize,
}

impl Config {
    /// Checks the configuration for values the gateway cannot run with.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.max_concurrent_statements == 0 {
            bail!("max concurrent statements must be at least 1");
        }
        if self.sql_client.statement_timeout.is_zero() {
            bail!("statement timeout must be positive");
        }
        if self.sql_client.max_output_size == 0 {
            bail!("max output size must be positive");
        }
        if self.max_request_size == 0 {
            bail!("max request size must be positive");
        }
        Ok(())
    }
}

/// Resolves a path given relative to the Flink installation.
///
/// Absolute paths are returned unchanged. Without a Flink installation,
/// relative paths are resolved against the working directory.
pub fn resolve_in_flink_root(flink_root: Option<&Path>, path: &Path) -> PathBuf {
    match flink_root {
        Some(root) if path.is_relative() => root.join(path),
        _ => path.to_path_buf(),
    }
}
