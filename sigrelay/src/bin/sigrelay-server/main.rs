// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use sigrelay::{
    config::load_config,
    server::{service::Server, Config},
};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, EnvFilter};

mod cli;

// The path, relative to $CONFIGURATION_DIRECTORY, of the default config file location.
const DEFAULT_CONFIG: &str = "sigrelay/server.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = cli::Cli::parse();

    // Unfortunately we can't use clap's value_parser since EnvFilter does not
    // implement Clone.
    let log_filter = EnvFilter::builder().parse(&opts.log_filter).context(
        "SIGRELAY_SERVER_LOG contains an invalid log directive; refer to \
            https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/\
            filter/struct.EnvFilter.html#directives for format details.",
    )?;
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry()
        .with(stderr_layer)
        .with(log_filter);
    tracing::subscriber::set_global_default(registry)
        .expect("Programming error: set_global_default should only be called once.");

    let mut config = load_config::<Config>(opts.config, PathBuf::from(DEFAULT_CONFIG).as_path())?;

    match opts.command {
        cli::Command::Listen {
            credentials_directory,
        } => {
            config
                .credentials
                .with_credentials_dir(&credentials_directory)?;
            tracing::info!(
                signing_command = ?config.signing_command,
                signing_timeout = config.signing_timeout,
                directory = ?config.directory,
                keys = config.keys.len(),
                "Starting signing server"
            );

            let root_span = tracing::info_span!("server");
            async move {
                let server = Server::new(config)?.run()?;
                tokio::spawn(signal_handler(server.halt_token(), server.abort_token()));

                server.wait_to_finish().await?;
                Ok::<_, anyhow::Error>(())
            }
            .instrument(root_span)
            .await?;
        }
        cli::Command::Config {
            credentials_directory,
        } => {
            println!("# This is the current configuration\n\n{config}\n# This concludes the configuration.\n");
            if let Err(error) = config.credentials.with_credentials_dir(&credentials_directory) {
                eprintln!("The configuration format is valid, but the referenced credentials aren't valid: {error:?}");
            }
        }
    };

    Ok(())
}

/// Install and manage signal handlers for the process.
///
/// # SIGTERM and SIGINT
///
/// The first SIGTERM or SIGINT stops the server from accepting new connections; signing
/// requests in progress run to completion. A second signal kills any signing tools still
/// running, and their clients are told the request timed out.
async fn signal_handler(
    halt_token: CancellationToken,
    abort_token: CancellationToken,
) -> anyhow::Result<()> {
    let mut sigterm_stream = signal(SignalKind::terminate()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGTERM signal handler");
    })?;
    let mut sigint_stream = signal(SignalKind::interrupt()).inspect_err(|error| {
        tracing::error!(?error, "Failed to register a SIGINT signal handler");
    })?;

    loop {
        let signal_name = tokio::select! {
            _ = sigterm_stream.recv() => "SIGTERM",
            _ = sigint_stream.recv() => "SIGINT",
        };
        if halt_token.is_cancelled() {
            tracing::warn!(
                signal = signal_name,
                "Shutdown already in progress; killing running signing tools"
            );
            abort_token.cancel();
        } else {
            tracing::info!(
                signal = signal_name,
                "Beginning service shutdown; running signing requests will be allowed to finish"
            );
            halt_token.cancel();
        }
    }
}
