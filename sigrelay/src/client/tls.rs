// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Builds the mutual-TLS connector used for every request to a signing server.

use std::io::Write;

use anyhow::anyhow;
use openssl::{
    pkey::PKey,
    ssl::{SslConnector, SslMethod, SslVerifyMode, SslVersion},
    x509::{store::X509StoreBuilder, X509},
};

use super::RemoteConfig;
use crate::{
    config::read_pem_setting,
    error::{ClientError, ConfigError},
};

fn credential_error(setting: &'static str, source: impl Into<anyhow::Error>) -> ClientError {
    ClientError::CredentialLoad {
        setting,
        source: source.into(),
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|value| !value.trim().is_empty())
}

/// Build an [`SslConnector`] from the remote configuration.
///
/// Certificates and keys are read from disk (or taken inline) every time this is called, so
/// credentials rotated on disk take effect on the next request. No network I/O occurs.
///
/// # Errors
///
/// A [`ConfigError`] if the configuration is incomplete, [`ClientError::CredentialLoad`] if
/// the certificate, key, or CA material can't be read or parsed, or [`ClientError::Ssl`] if
/// OpenSSL rejects the resulting configuration, including a key that doesn't match the
/// certificate.
pub fn build(config: &RemoteConfig) -> Result<SslConnector, ClientError> {
    if non_empty(&config.url).is_none() && non_empty(&config.directory_url).is_none() {
        return Err(ConfigError::MissingTarget.into());
    }
    let (Some(certfile), Some(keyfile)) = (non_empty(&config.certfile), non_empty(&config.keyfile))
    else {
        return Err(ConfigError::MissingCredentials.into());
    };

    let certificate_pem =
        read_pem_setting(certfile).map_err(|error| credential_error("certfile", error))?;
    let mut certificates = X509::stack_from_pem(&certificate_pem)
        .map_err(|error| credential_error("certfile", error))?
        .into_iter();
    let certificate = certificates
        .next()
        .ok_or_else(|| credential_error("certfile", anyhow!("no PEM certificate found")))?;
    let key_pem = read_pem_setting(keyfile).map_err(|error| credential_error("keyfile", error))?;
    let private_key =
        PKey::private_key_from_pem(&key_pem).map_err(|error| credential_error("keyfile", error))?;

    let mut connector = SslConnector::builder(SslMethod::tls_client())?;
    connector.set_verify(SslVerifyMode::PEER);
    connector.set_min_proto_version(Some(SslVersion::TLS1_2))?;
    connector.set_certificate(&certificate)?;
    for chain_certificate in certificates {
        connector.add_extra_chain_cert(chain_certificate)?;
    }
    connector.set_private_key(&private_key)?;
    connector.check_private_key()?;

    if let Some(cacert) = non_empty(&config.cacert) {
        let ca_pem = read_pem_setting(cacert).map_err(|error| credential_error("cacert", error))?;
        let ca_certificates =
            X509::stack_from_pem(&ca_pem).map_err(|error| credential_error("cacert", error))?;
        if ca_certificates.is_empty() {
            return Err(credential_error(
                "cacert",
                anyhow!("no PEM certificates found"),
            ));
        }
        let mut store = X509StoreBuilder::new()?;
        for ca_certificate in ca_certificates {
            store.add_cert(ca_certificate)?;
        }
        connector.set_cert_store(store.build());
    }

    if let Some(keylog_file) = config.keylog_file.clone() {
        tracing::warn!(
            path = %keylog_file.display(),
            "TLS session keys are being logged; traffic can be decrypted by anyone with this file"
        );
        connector.set_keylog_callback(move |_, line| {
            let result = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&keylog_file)
                .and_then(|mut file| writeln!(file, "{line}"));
            if let Err(error) = result {
                tracing::warn!(?error, "Failed to write to the TLS key log");
            }
        });
    }

    Ok(connector.build())
}
