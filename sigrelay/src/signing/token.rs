// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Signing keys and the tokens that hold them.

use std::{collections::BTreeMap, path::PathBuf};

use anyhow::Context;
use openssl::{
    pkey::{PKey, Private},
    x509::X509,
};
use serde::{Deserialize, Serialize};

use super::SignError;

/// Where a named key lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "token", rename_all = "lowercase")]
pub enum KeyConfig {
    /// A PEM private key on disk, with its certificate.
    File {
        /// The PEM-encoded private key.
        private_key: PathBuf,
        /// The PEM-encoded certificate for the key. Formats that embed the certificate in the
        /// signature can't be used without it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        certificate: Option<PathBuf>,
    },
    /// A key of the same name held by the signing servers.
    Remote,
}

/// A key whose private half is available to this process.
pub struct LocalKey {
    pub name: String,
    pub certificate: Option<X509>,
    pub private_key: PKey<Private>,
}

impl std::fmt::Debug for LocalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKey")
            .field("name", &self.name)
            .field("certificate", &self.certificate)
            .finish_non_exhaustive()
    }
}

impl LocalKey {
    /// Load a key and its optional certificate from PEM files.
    pub fn load(
        name: &str,
        private_key: &std::path::Path,
        certificate: Option<&std::path::Path>,
    ) -> anyhow::Result<Self> {
        let key_pem = std::fs::read(private_key)
            .with_context(|| format!("failed to read private key {private_key:?}"))?;
        let private_key = PKey::private_key_from_pem(&key_pem)
            .with_context(|| format!("{private_key:?} is not a PEM private key"))?;
        let certificate = certificate
            .map(|path| -> anyhow::Result<X509> {
                let pem = std::fs::read(path)
                    .with_context(|| format!("failed to read certificate {path:?}"))?;
                X509::from_pem(&pem).with_context(|| format!("{path:?} is not a PEM certificate"))
            })
            .transpose()?;

        if let Some(certificate) = &certificate {
            let public_key = certificate.public_key()?;
            if !public_key.public_eq(&*private_key) {
                anyhow::bail!("the certificate does not match the private key");
            }
        }

        Ok(Self {
            name: name.to_string(),
            certificate,
            private_key,
        })
    }
}

/// A key acquired for a signing operation.
#[derive(Debug)]
pub enum Key {
    Local(LocalKey),
    Remote { name: String },
}

impl Key {
    pub fn name(&self) -> &str {
        match self {
            Key::Local(key) => &key.name,
            Key::Remote { name } => name,
        }
    }
}

/// Acquire a key by name from the configured keys.
///
/// # Errors
///
/// [`SignError::KeyNotFound`] if no key has the name, and [`SignError::TokenUnavailable`] if
/// the key's token can't be read.
pub fn open_key(keys: &BTreeMap<String, KeyConfig>, name: &str) -> Result<Key, SignError> {
    match keys.get(name) {
        None => Err(SignError::KeyNotFound(name.to_string())),
        Some(KeyConfig::Remote) => Ok(Key::Remote {
            name: name.to_string(),
        }),
        Some(KeyConfig::File {
            private_key,
            certificate,
        }) => LocalKey::load(name, private_key, certificate.as_deref())
            .map(Key::Local)
            .map_err(|source| SignError::TokenUnavailable {
                name: name.to_string(),
                source,
            }),
    }
}
