// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::path::PathBuf;
#[cfg(feature = "cli")]
use std::env;

#[cfg(feature = "cli")]
use anyhow::Context;
use openssl::{
    ssl::{SslAcceptor, SslFiletype, SslMethod, SslVerifyMode, SslVersion},
    x509::X509,
};
use serde::{Deserialize, Serialize};

/// The marker identifying a configuration value as inline PEM rather than a path.
const PEM_MARKER: &str = "-----BEGIN";

/// Credentials the server uses to authenticate itself and its clients.
///
/// It is highly recommended that you use systemd credentials to ensure the private key is
/// only accessible to the service using it. If the paths provided are relative, it is assumed
/// to be relative to the `$CREDENTIALS_DIRECTORY` environment variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// The systemd credentials ID of the PEM-encoded private key file.
    ///
    /// This private key is the key that matches the `certificate`. It is expected to be
    /// provided by systemd's "ImportCredential" or "LoadCredentialEncrypted" option.
    ///
    /// # Example
    ///
    /// To prepare the encrypted configuration:
    ///
    /// ```bash
    /// systemd-creds encrypt /secure/ramfs/private-key.pem /etc/credstore.encrypted/sigrelay.server.private_key
    /// ```
    ///
    /// This will produce an encrypted blob which will be decrypted by systemd at runtime.
    pub private_key: PathBuf,
    /// The path to the certificate that matches the `private_key`.
    pub certificate: PathBuf,
    /// The path to the certificate authority that issues client certificates.
    pub ca_certificate: PathBuf,
}

impl Credentials {
    /// Build the acceptor for incoming client connections.
    ///
    /// Clients must present a certificate issued by the configured certificate authority.
    pub(crate) fn ssl_acceptor(&self) -> anyhow::Result<SslAcceptor> {
        // TODO bump to mozilla_modern_v5 if RHEL10 supports that
        let mut acceptor = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;
        let client_ca_cert =
            X509::from_pem(std::fs::read_to_string(&self.ca_certificate)?.as_bytes())?;
        acceptor.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
        acceptor.set_min_proto_version(Some(SslVersion::TLS1_3))?;
        acceptor.set_max_proto_version(Some(SslVersion::TLS1_3))?;
        acceptor.add_client_ca(&client_ca_cert)?;
        acceptor.set_ca_file(&self.ca_certificate)?;
        acceptor.set_private_key_file(&self.private_key, SslFiletype::PEM)?;
        acceptor.set_certificate_chain_file(&self.certificate)?;
        acceptor.check_private_key()?;

        Ok(acceptor.build())
    }

    /// Resolve relative paths against the systemd credentials directory.
    ///
    /// # Errors
    ///
    /// If a relative path doesn't name a file in the credentials directory, an error is
    /// returned.
    pub fn with_credentials_dir(
        &mut self,
        credentials_dir: &std::path::Path,
    ) -> anyhow::Result<()> {
        if self.private_key.is_absolute() {
            tracing::warn!(
                private_key = %self.private_key.display(),
                "Server private key is not a systemd credential; consider using LoadCredentialEncrypted"
            );
        }
        for (setting, path) in [
            ("private_key", &mut self.private_key),
            ("certificate", &mut self.certificate),
            ("ca_certificate", &mut self.ca_certificate),
        ] {
            if path.is_absolute() {
                continue;
            }
            *path = credentials_dir.join(&*path);
            if !path.is_file() {
                return Err(anyhow::anyhow!(
                    "credentials.{setting}: '{}' not found in credentials directory",
                    path.display()
                ));
            }
        }

        Ok(())
    }
}

/// Returns true if a configuration value holds PEM text rather than a path to it.
pub fn is_inline_pem(value: &str) -> bool {
    value.contains(PEM_MARKER)
}

/// Read PEM material that is configured either inline or as a path to a file.
///
/// The file is read on every call so rotated credentials are picked up without a restart.
pub fn read_pem_setting(value: &str) -> std::io::Result<Vec<u8>> {
    if is_inline_pem(value) {
        Ok(value.as_bytes().to_vec())
    } else {
        std::fs::read(value)
    }
}

#[cfg(feature = "cli")]
fn private_load_config<T>(path: &std::path::Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    let config = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read from path {path:?}"))?;
    tracing::info!(path=%path.display(), "Read from configuration file");
    toml::from_str(&config)
        .inspect_err(|error| {
            eprintln!("Failed to parse configuration loaded from {path:?}:\n{error}");
            eprintln!("Example config file:\n\n{}", T::default());
        })
        .context("configuration file is invalid")
}

/// Load the configuration with fallback options.
///
/// If `path` is [`None`], the `default` path, which should be relative to CONFIGURATION_DIRECTORY, is
/// checked.  If the default config doesn't exist, the [`Default`] implementation is returned. It's
/// expected that CONFIGURATION_DIRECTORY is set via systemd.
///
/// # Errors
///
/// In the event that one of the config files exists, but is invalid, an error is returned.
#[cfg(feature = "cli")]
pub fn load_config<T>(path: Option<PathBuf>, default: &std::path::Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    path.or_else(|| {
        env::var("CONFIGURATION_DIRECTORY")
            .inspect_err(|error| {
                tracing::debug!(
                    ?error,
                    "CONFIGURATION_DIRECTORY environment variable isn't readable"
                );
            })
            .map(PathBuf::from)
            .ok()
            .map(|base_path| base_path.join(default))
            .filter(|path| path.is_file())
    })
    .map_or_else(
        || {
            tracing::warn!("No configuration file found; using defaults");
            Ok(T::default())
        },
        |path| {
            tracing::info!(?path, "Attempting to load configuration");
            private_load_config::<T>(&path)
        },
    )
}
