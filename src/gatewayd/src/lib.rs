// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! An HTTP gateway that runs SQL statements through an external SQL client.
//!
//! Each statement posted to `/v1/sessions/{session_id}/statements` is written
//! to a script file in the scratch directory, executed by the SQL client, and
//! reported back as JSON once the client has exited. The script file never
//! outlives the request.
//!
//! Sessions are not stateful. The session id only selects the scratch
//! subdirectory a request's script file is written to.

use std::net::SocketAddr;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::admission::Admission;
use crate::config::Config;
use crate::dispatch::SqlClient;
use crate::http::GatewayState;
use crate::metrics::Metrics;

pub mod admission;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod metrics;
pub mod script;
pub mod session;

/// Starts a gateway.
///
/// The listener is bound before this function returns, so the server's
/// address is known even when listening on port 0.
pub async fn serve(config: Config) -> Result<Server, anyhow::Error> {
    config.validate()?;
    tokio::fs::create_dir_all(&config.scratch_dir)
        .await
        .with_context(|| {
            format!(
                "creating scratch directory {}",
                config.scratch_dir.display()
            )
        })?;

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding to {}", config.listen_addr))?;
    let local_addr = listener.local_addr()?;

    let shutdown = CancellationToken::new();
    let admission = Admission::new(config.max_concurrent_statements, config.admission_timeout);
    let state = GatewayState {
        client: SqlClient::new(&config.sql_client),
        scratch_dir: config.scratch_dir.clone(),
        admission: admission.clone(),
        metrics: Metrics::register()?,
        shutdown: shutdown.clone(),
    };
    let router = http::router(
        state,
        config.max_request_size,
        &config.cors_allowed_origins,
    );

    info!(
        %local_addr,
        sql_client = %config.sql_client.program.display(),
        plugin_dir = %config.sql_client.plugin_dir.display(),
        scratch_dir = %config.scratch_dir.display(),
        max_concurrent_statements = config.max_concurrent_statements,
        "listening for statements"
    );
    let task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        }
    });

    Ok(Server {
        local_addr,
        admission,
        shutdown,
        task,
    })
}

/// A running gateway.
#[derive(Debug)]
pub struct Server {
    local_addr: SocketAddr,
    admission: Admission,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), std::io::Error>>,
}

impl Server {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Begins shutting down.
    ///
    /// Readiness checks start failing, queued statements are rejected, running
    /// SQL clients are killed, and the server stops accepting connections
    /// once in-flight requests have been answered.
    pub fn shutdown(&self) {
        info!("shutting down");
        self.admission.close();
        self.shutdown.cancel();
    }

    /// Waits for the server to exit.
    pub async fn wait(self) -> Result<(), anyhow::Error> {
        self.task.await.context("server task failed")??;
        info!("server exited");
        Ok(())
    }
}
