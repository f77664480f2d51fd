// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Format modules: how a particular kind of artifact is signed.
//!
//! A format module decides which bytes of an artifact are covered by the signature, produces
//! the signature with a key, and merges the signature back into the artifact.

use std::{
    collections::BTreeMap,
    io::{Read, Seek},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, Context};
use openssl::{
    base64,
    pkey::{Id, PKeyRef, Private, Public},
    sign::{Signer, Verifier},
    x509::X509,
};

use super::{atomic::Destination, raw::Raw, script::Script, token::LocalKey};
use crate::protocol::DigestAlgorithm;

/// Signing fails with a message containing this when a key has no certificate. The server
/// relies on it to tell the client the key can't make this kind of signature.
pub const NO_CERTIFICATE: &str = "no certificate of type X.509 found for key";

/// Input that can be rewound after checking whether it's already signed.
pub trait InputStream: Read + Seek + Send {}

impl<T: Read + Seek + Send> InputStream for T {}

/// A flag a format module accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagDef {
    pub name: &'static str,
    pub description: &'static str,
}

/// Settings for one signing operation, shared by every format module capability.
#[derive(Debug, Clone, Default)]
pub struct SignOptions {
    pub digest: DigestAlgorithm,
    /// Flags explicitly set for this operation, already validated against the module.
    pub flags: BTreeMap<String, String>,
    /// The input file, when the input isn't a stream.
    pub path: Option<PathBuf>,
}

impl SignOptions {
    /// Returns true if a boolean flag is set to a true value.
    pub fn flag_enabled(&self, name: &str) -> bool {
        self.flags
            .get(name)
            .is_some_and(|value| matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | ""))
    }
}

/// The result of verifying a signature.
#[derive(Debug, Clone)]
pub struct Verified {
    pub certificate: X509,
    pub digest: DigestAlgorithm,
}

/// An artifact prepared for signing.
pub trait Transform: Send {
    /// The bytes covered by the signature.
    fn to_be_signed(&self) -> anyhow::Result<Box<dyn Read + Send + '_>>;

    /// Merge the signed bytes into the artifact and commit it to `destination` atomically.
    fn apply(&self, destination: &Destination, mime_type: &str, signed: &[u8])
        -> anyhow::Result<()>;
}

/// The capabilities of a kind of artifact.
pub trait FormatModule: Send + Sync {
    fn name(&self) -> &'static str;

    /// File extensions, without the leading dot, used to pick the module when no signature
    /// type is given.
    fn extensions(&self) -> &'static [&'static str] {
        &[]
    }

    fn flags(&self) -> &'static [FlagDef] {
        &[]
    }

    fn mime_type(&self) -> &'static str {
        "application/octet-stream"
    }

    fn allow_stdin(&self) -> bool {
        false
    }

    fn can_sign(&self) -> bool {
        true
    }

    /// Where output goes when none is given; in place by default.
    fn default_output(&self, input: &Path) -> PathBuf {
        input.to_path_buf()
    }

    /// Returns true if the input already carries a signature.
    fn is_signed(&self, _input: &mut dyn InputStream) -> anyhow::Result<bool> {
        Err(anyhow!(
            "signature type '{}' cannot check whether input is already signed",
            self.name()
        ))
    }

    fn transform(
        &self,
        input: &mut dyn InputStream,
        options: &SignOptions,
    ) -> anyhow::Result<Box<dyn Transform>>;

    /// Sign the to-be-signed bytes, producing what [`Transform::apply`] merges.
    fn sign(&self, payload: &[u8], key: &LocalKey, options: &SignOptions)
        -> anyhow::Result<Vec<u8>>;

    /// Returns true if [`FormatModule::fixup`] should run on the committed output.
    fn needs_fixup(&self, _options: &SignOptions) -> bool {
        false
    }

    /// Adjust the committed output in place.
    ///
    /// Fixups must not change the bytes covered by the signature.
    fn fixup(&self, _output: &mut std::fs::File, _options: &SignOptions) -> anyhow::Result<()> {
        Ok(())
    }

    /// Check a signature. `signature` is the detached signature, for formats that have one.
    fn verify(&self, _content: &[u8], _signature: Option<&[u8]>) -> anyhow::Result<Verified> {
        Err(anyhow!(
            "signature type '{}' does not support verification",
            self.name()
        ))
    }
}

static MODULES: &[&dyn FormatModule] = &[&Raw, &Script];

/// All available format modules.
pub fn modules() -> &'static [&'static dyn FormatModule] {
    MODULES
}

/// Look up a format module by its signature type name.
pub fn by_name(name: &str) -> Option<&'static dyn FormatModule> {
    MODULES
        .iter()
        .copied()
        .find(|module| module.name().eq_ignore_ascii_case(name))
}

/// Pick a format module from a file's extension.
pub fn detect(path: &Path) -> Option<&'static dyn FormatModule> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    MODULES
        .iter()
        .copied()
        .find(|module| module.extensions().contains(&extension.as_str()))
}

fn is_digestless(id: Id) -> bool {
    id == Id::ED25519 || id == Id::ED448
}

/// A signature together with what's needed to check it: the digest and the signer's
/// certificate.
///
/// Serialized as `name: value` lines, each behind a caller-chosen prefix, so it can be
/// embedded in formats that have a comment syntax.
#[derive(Debug, Clone)]
pub struct SignatureBlock {
    pub digest: DigestAlgorithm,
    pub certificate: X509,
    pub signature: Vec<u8>,
}

impl SignatureBlock {
    /// Sign `payload` with a key, which must have a certificate.
    pub fn create(
        payload: &[u8],
        key: &LocalKey,
        digest: DigestAlgorithm,
    ) -> anyhow::Result<Self> {
        let certificate = key
            .certificate
            .clone()
            .ok_or_else(|| anyhow!("{NO_CERTIFICATE} '{}'", key.name))?;
        let signature = sign_bytes(&key.private_key, digest, payload)?;
        Ok(Self {
            digest,
            certificate,
            signature,
        })
    }

    pub fn render(&self, prefix: &str) -> anyhow::Result<String> {
        let certificate = base64::encode_block(&self.certificate.to_der()?);
        let signature = base64::encode_block(&self.signature);
        Ok(format!(
            "{prefix}digest: {}\n{prefix}certificate: {certificate}\n{prefix}signature: {signature}\n",
            self.digest
        ))
    }

    /// Parse the lines of a block; lines without `prefix` or with unknown names are ignored.
    pub fn parse(text: &str, prefix: &str) -> anyhow::Result<Self> {
        let mut digest = None;
        let mut certificate = None;
        let mut signature = None;
        for line in text.lines() {
            let Some((name, value)) = line
                .trim_end_matches('\r')
                .strip_prefix(prefix)
                .and_then(|field| field.split_once(": "))
            else {
                continue;
            };
            match name {
                "digest" => digest = Some(value.parse::<DigestAlgorithm>()?),
                "certificate" => {
                    let der = base64::decode_block(value).context("invalid certificate encoding")?;
                    certificate = Some(X509::from_der(&der).context("invalid certificate")?);
                }
                "signature" => {
                    signature =
                        Some(base64::decode_block(value).context("invalid signature encoding")?)
                }
                _ => {}
            }
        }

        Ok(Self {
            digest: digest.ok_or_else(|| anyhow!("signature block has no digest"))?,
            certificate: certificate.ok_or_else(|| anyhow!("signature block has no certificate"))?,
            signature: signature.ok_or_else(|| anyhow!("signature block has no signature"))?,
        })
    }

    /// Check the signature over `payload` against the embedded certificate.
    pub fn verify(&self, payload: &[u8]) -> anyhow::Result<Verified> {
        let public_key = self.certificate.public_key()?;
        if !verify_bytes(&public_key, self.digest, payload, &self.signature)? {
            anyhow::bail!("signature does not match the content");
        }
        Ok(Verified {
            certificate: self.certificate.clone(),
            digest: self.digest,
        })
    }
}

fn sign_bytes(
    key: &PKeyRef<Private>,
    digest: DigestAlgorithm,
    payload: &[u8],
) -> anyhow::Result<Vec<u8>> {
    let mut signer = if is_digestless(key.id()) {
        Signer::new_without_digest(key)?
    } else {
        Signer::new(digest.into(), key)?
    };
    Ok(signer.sign_oneshot_to_vec(payload)?)
}

fn verify_bytes(
    key: &PKeyRef<Public>,
    digest: DigestAlgorithm,
    payload: &[u8],
    signature: &[u8],
) -> anyhow::Result<bool> {
    let mut verifier = if is_digestless(key.id()) {
        Verifier::new_without_digest(key)?
    } else {
        Verifier::new(digest.into(), key)?
    };
    Ok(verifier.verify_oneshot(signature, payload)?)
}
