// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::{collections::BTreeMap, io::Write, path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use sigrelay::{
    client::{Config, RemoteClient},
    config::load_config,
    signing::{
        atomic::Destination, format, Session, SignOutcome, SignRequest, Source, StreamRequest,
    },
};
use tracing_subscriber::{fmt::format::FmtSpan, layer::SubscriberExt, EnvFilter};

// The path, relative to $CONFIGURATION_DIRECTORY, of the default config file location.
const DEFAULT_CONFIG: &str = "sigrelay/sigrelay.toml";

/// The sigrelay client and signing tool.
///
/// Signs artifacts with keys configured locally, or by sending them to a signing server. The
/// signing server runs the `sign-stream` subcommand to make signatures with its own keys.
///
/// To begin, you'll need to provide a configuration file. For an example of the current
/// format, consult the `config` subcommand.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// The path to the configuration file.
    ///
    /// If no path is provided, the configuration file at
    /// $CONFIGURATION_DIRECTORY/sigrelay/sigrelay.toml is used, if it exists. If it does not
    /// exist, the configuration defaults are used.
    #[arg(long, short, env = "SIGRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Append TLS session keys to this file so connections can be decrypted when debugging.
    ///
    /// This overrides `keylog_file` in the configuration file.
    #[arg(long, env = "SSLKEYLOGFILE")]
    keylog_file: Option<PathBuf>,

    /// A set of one or more comma-separated directives to filter logs.
    ///
    /// The general format is "target_name[span_name{field=value}]=level" where level is
    /// one of TRACE, DEBUG, INFO, WARN, ERROR.
    ///
    /// Details: https://docs.rs/tracing-subscriber/0.3.19/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[arg(long, env = "SIGRELAY_LOG", default_value = "WARN,sigrelay=INFO")]
    log_filter: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Sign a file, or standard input if the input is "-".
    Sign {
        /// The name of the key to sign with.
        #[arg(long, short)]
        key: String,
        /// The signature type. If not given, it's picked from the input's file extension.
        #[arg(long, short = 'T')]
        sig_type: Option<String>,
        /// The digest algorithm to use; sha256 if not given.
        #[arg(long)]
        digest: Option<String>,
        /// Where to write the signed output; "-" for standard output.
        ///
        /// Defaults to the signature type's choice: in place for most types.
        #[arg(long, short)]
        output: Option<Destination>,
        /// Don't sign input that's already signed.
        #[arg(long)]
        if_unsigned: bool,
        /// A flag for the signature type, as name=value. May be repeated.
        #[arg(long = "param", value_parser = parse_pair)]
        params: Vec<(String, String)>,
        /// An extra attribute for the audit record, as name=value. May be repeated.
        #[arg(long = "attr", value_parser = parse_pair)]
        attributes: Vec<(String, String)>,
        input: Source,
    },

    /// Sign content read from standard input with a local key, writing the signature to
    /// standard output.
    ///
    /// This is what signing servers run for each request.
    SignStream {
        #[arg(long, short)]
        key: String,
        #[arg(long, short = 'T')]
        sig_type: String,
        #[arg(long)]
        digest: Option<String>,
        #[arg(long = "param", value_parser = parse_pair)]
        params: Vec<(String, String)>,
        #[arg(long = "attr", value_parser = parse_pair)]
        attributes: Vec<(String, String)>,
    },

    /// Check the signature on a file.
    Verify {
        /// The signature type. If not given, it's picked from the input's file extension.
        #[arg(long, short = 'T')]
        sig_type: Option<String>,
        /// The detached signature, for signature types that produce one.
        #[arg(long)]
        signature: Option<PathBuf>,
        input: PathBuf,
    },

    /// List the keys offered by the signing server.
    ListKeys,

    /// Print the certificate of a key offered by the signing server.
    GetKey { key: String },

    /// List the signature types and the flags they accept.
    ListTypes,

    /// See the current configuration, or the defaults if no configuration file is supplied.
    Config,
}

fn parse_pair(value: &str) -> Result<(String, String), String> {
    value
        .split_once('=')
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected name=value, got '{value}'"))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let opts = Cli::parse();

    // Unfortunately we can't use clap's value_parser since EnvFilter does not
    // implement Clone.
    let log_filter = EnvFilter::builder().parse(&opts.log_filter).context(
        "SIGRELAY_LOG contains an invalid log directive; refer to \
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
    if let (Some(keylog_file), Some(remote)) = (opts.keylog_file, config.remote.as_mut()) {
        remote.keylog_file = Some(keylog_file);
    }
    let config = Arc::new(config);

    match opts.command {
        Command::Sign {
            key,
            sig_type,
            digest,
            output,
            if_unsigned,
            params,
            attributes,
            input,
        } => {
            let request = SignRequest {
                input,
                output,
                key,
                digest,
                sig_type,
                if_unsigned,
                flags: params.into_iter().collect(),
                attributes: attributes.into_iter().collect(),
            };
            match Session::new(config).sign(request).await? {
                SignOutcome::Signed {
                    output: Destination::File(path),
                } => eprintln!("Signed {}", path.display()),
                SignOutcome::Signed { .. } => {}
                SignOutcome::AlreadySigned => eprintln!("Input is already signed; skipped"),
            }
        }
        Command::SignStream {
            key,
            sig_type,
            digest,
            params,
            attributes,
        } => {
            let request = StreamRequest {
                key,
                sig_type,
                digest,
                flags: params.into_iter().collect(),
                attributes: attributes.into_iter().collect::<BTreeMap<_, _>>(),
            };
            let mut stdin = std::io::stdin().lock();
            let mut stdout = std::io::stdout().lock();
            Session::new(config).sign_stream(request, &mut stdin, &mut stdout)?;
        }
        Command::Verify {
            sig_type,
            signature,
            input,
        } => {
            let module = match &sig_type {
                Some(sig_type) => format::by_name(sig_type),
                None => format::detect(&input),
            }
            .with_context(|| format!("unsupported signature type for {}", input.display()))?;
            let content = std::fs::read(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let signature = signature
                .map(|path| {
                    std::fs::read(&path)
                        .with_context(|| format!("failed to read {}", path.display()))
                })
                .transpose()?;
            let verified = module.verify(&content, signature.as_deref())?;
            let signer = sigrelay::protocol::common_name(&verified.certificate)
                .unwrap_or_else(|| "<no common name>".to_string());
            println!(
                "Signature OK\nSigner: {signer}\nFingerprint: {}\nDigest: {}",
                sigrelay::protocol::fingerprint(&verified.certificate)?,
                verified.digest
            );
        }
        Command::ListKeys => {
            let keys = RemoteClient::new(config).list_keys().await?;
            println!("{}", keys.join("\n"));
        }
        Command::GetKey { key } => {
            let certificate = RemoteClient::new(config).get_certificate(&key).await?;
            std::io::stdout().write_all(&certificate.to_pem()?)?;
        }
        Command::ListTypes => {
            for module in format::modules() {
                println!("{}", module.name());
                for flag in module.flags() {
                    println!("    {}: {}", flag.name, flag.description);
                }
            }
        }
        Command::Config => {
            println!(
                "# This is the current configuration\n\n{config}\n# This concludes the configuration.\n"
            );
        }
    }

    Ok(())
}
