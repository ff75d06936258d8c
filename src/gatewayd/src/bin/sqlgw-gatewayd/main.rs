// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Runs the SQL gateway.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use http::HeaderValue;
use sqlgw_gatewayd::config::{self, Config, SqlClientConfig};
use sqlgw_ore::cli::{self, CliConfig};
use sqlgw_ore::tracing::TracingCliArgs;
use tracing::info;

const ENV_PREFIX: &str = "SIMPLE_FLINK_SQL_GATEWAY_";

/// Accepts SQL statements over HTTP and runs them through the Flink SQL client.
#[derive(clap::Parser, Debug)]
#[clap(name = "sqlgw-gatewayd", version, next_line_help = true)]
struct Args {
    /// The port to listen on.
    #[clap(long, env = "PORT", value_name = "PORT", default_value_t = config::DEFAULT_PORT)]
    port: u16,
    /// The address to listen on.
    #[clap(
        long,
        env = "HOST",
        value_name = "HOST",
        default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    )]
    listen_host: IpAddr,
    /// The root of the Flink installation.
    #[clap(long, env = "ROOT", value_name = "PATH", default_value = "./flink-1.13.0")]
    flink_root: PathBuf,
    /// The plugin directory passed to the SQL client.
    #[clap(long, env = "PLUGINS", value_name = "PATH", default_value = "./plugins")]
    plugin_dir: PathBuf,
    /// The SQL client executable. Relative paths are resolved against
    /// `--flink-root`.
    #[clap(
        long,
        env = "SQL_CLIENT",
        value_name = "PATH",
        default_value = "bin/sql-client.sh"
    )]
    sql_client: PathBuf,
    /// The directory in which script files are written. Defaults to
    /// `sql-gateway` in the system temporary directory.
    #[clap(long, env = "SCRATCH_DIR", value_name = "PATH")]
    scratch_dir: Option<PathBuf>,
    /// How long a single statement may run before the SQL client is killed.
    #[clap(
        long,
        env = "STATEMENT_TIMEOUT",
        value_name = "DURATION",
        value_parser = humantime::parse_duration,
        default_value = "5m"
    )]
    statement_timeout: Duration,
    /// The maximum number of SQL clients that may run at once.
    #[clap(
        long,
        env = "MAX_CONCURRENT_STATEMENTS",
        value_name = "N",
        default_value = "4"
    )]
    max_concurrent_statements: usize,
    /// How long a statement may wait for a free slot before it is rejected.
    #[clap(
        long,
        env = "ADMISSION_TIMEOUT",
        value_name = "DURATION",
        value_parser = humantime::parse_duration,
        default_value = "10s"
    )]
    admission_timeout: Duration,
    /// The maximum size of a request body, in bytes.
    #[clap(
        long,
        env = "MAX_REQUEST_SIZE",
        value_name = "BYTES",
        default_value_t = config::DEFAULT_MAX_REQUEST_SIZE
    )]
    max_request_size: usize,
    /// The maximum number of bytes captured from each of the SQL client's
    /// output streams.
    #[clap(
        long,
        env = "MAX_OUTPUT_SIZE",
        value_name = "BYTES",
        default_value_t = config::DEFAULT_MAX_OUTPUT_SIZE
    )]
    max_output_size: usize,
    /// An origin allowed to make cross-origin requests. May be repeated. `*`
    /// allows any origin.
    #[clap(
        long,
        env = "CORS_ALLOWED_ORIGIN",
        value_name = "ORIGIN",
        value_delimiter = ','
    )]
    cors_allowed_origin: Vec<HeaderValue>,

    #[clap(flatten)]
    tracing: TracingCliArgs,
}

fn main() {
    let args = cli::parse_args(CliConfig {
        env_prefix: Some(ENV_PREFIX),
        enable_version_flag: true,
    });
    if let Err(err) = run(args) {
        eprintln!("sqlgw-gatewayd: {:#}", err);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<(), anyhow::Error> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(usize::max(1, num_cpus::get()))
        // The default thread name exceeds the Linux limit on thread name
        // length, so pick something shorter.
        .thread_name_fn(|| {
            static ATOMIC_ID: AtomicUsize = AtomicUsize::new(0);
            let id = ATOMIC_ID.fetch_add(1, Ordering::SeqCst);
            format!("tokio:work-{}", id)
        })
        .enable_all()
        .build()?;

    sqlgw_ore::tracing::configure("sqlgw-gatewayd", &args.tracing)?;
    info!(
        invocation = %sqlgw_ore::process::invocation(ENV_PREFIX),
        "booting server"
    );

    let config = Config {
        listen_addr: SocketAddr::new(args.listen_host, args.port),
        sql_client: SqlClientConfig {
            program: config::resolve_in_flink_root(Some(&args.flink_root), &args.sql_client),
            plugin_dir: args.plugin_dir,
            statement_timeout: args.statement_timeout,
            max_output_size: args.max_output_size,
        },
        scratch_dir: args
            .scratch_dir
            .unwrap_or_else(|| std::env::temp_dir().join("sql-gateway")),
        max_concurrent_statements: args.max_concurrent_statements,
        admission_timeout: args.admission_timeout,
        max_request_size: args.max_request_size,
        cors_allowed_origins: args.cors_allowed_origin,
    };

    runtime.block_on(async {
        let server = sqlgw_gatewayd::serve(config).await?;
        termination_signal().await?;
        server.shutdown();
        server.wait().await
    })
}

/// Resolves when the process is asked to terminate.
async fn termination_signal() -> Result<(), anyhow::Error> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("waiting for SIGINT")?,
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    Ok(())
}
