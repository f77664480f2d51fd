// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Types shared by the client and server halves of the HTTP protocol.
//!
//! Requests are plain HTTP/1.1 over mutually-authenticated TLS. Successful responses carry the
//! result directly in the body; failed responses carry an [`ErrorResponse`] serialized as JSON.

use std::{fmt::Display, str::FromStr};

use openssl::{hash::MessageDigest, nid::Nid, x509::X509Ref};
use serde::{Deserialize, Serialize};

/// The User-Agent sent with every client request.
pub const USER_AGENT: &str = concat!("sigrelay/", env!("CARGO_PKG_VERSION"));

/// Endpoint returning the newline-separated list of live server base URLs.
pub const DIRECTORY_ENDPOINT: &str = "directory";
/// Endpoint returning the newline-separated list of key names the server offers.
pub const LIST_KEYS_ENDPOINT: &str = "list_keys";
/// Endpoint returning the PEM certificate of a key.
pub const GET_KEY_ENDPOINT: &str = "get_key";
/// Endpoint accepting content to sign.
pub const SIGN_ENDPOINT: &str = "sign";
/// Liveness endpoint.
pub const HEALTH_ENDPOINT: &str = "health";

/// Query parameters with a fixed meaning on the sign endpoint. Any other query parameter is
/// passed to the format module as a flag.
pub mod query {
    pub const KEY: &str = "key";
    pub const SIG_TYPE: &str = "sigtype";
    pub const DIGEST: &str = "digest";
    pub const FILENAME: &str = "filename";

    /// Returns true if the parameter is reserved by the protocol and is not a format flag.
    pub fn is_reserved(name: &str) -> bool {
        matches!(name, KEY | SIG_TYPE | DIGEST | FILENAME)
    }
}

/// The body of any response with a status of 300 or greater.
///
/// The message is deliberately terse; it never includes output from the signing tool or any
/// other server-side detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: u16,
    pub message: String,
}

/// The digest algorithms supported for signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DigestAlgorithm {
    #[default]
    Sha256,
    Sha384,
    Sha512,
    #[serde(rename = "sha3-256")]
    Sha3_256,
    #[serde(rename = "sha3-512")]
    Sha3_512,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
            DigestAlgorithm::Sha384 => "sha384",
            DigestAlgorithm::Sha512 => "sha512",
            DigestAlgorithm::Sha3_256 => "sha3-256",
            DigestAlgorithm::Sha3_512 => "sha3-512",
        }
    }
}

impl Display for DigestAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a digest name isn't one of the supported algorithms.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown digest algorithm '{0}'")]
pub struct UnknownDigest(pub String);

impl FromStr for DigestAlgorithm {
    type Err = UnknownDigest;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "sha256" | "sha-256" => Ok(DigestAlgorithm::Sha256),
            "sha384" | "sha-384" => Ok(DigestAlgorithm::Sha384),
            "sha512" | "sha-512" => Ok(DigestAlgorithm::Sha512),
            "sha3-256" => Ok(DigestAlgorithm::Sha3_256),
            "sha3-512" => Ok(DigestAlgorithm::Sha3_512),
            _ => Err(UnknownDigest(s.to_string())),
        }
    }
}

impl From<DigestAlgorithm> for MessageDigest {
    fn from(value: DigestAlgorithm) -> Self {
        match value {
            DigestAlgorithm::Sha256 => MessageDigest::sha256(),
            DigestAlgorithm::Sha384 => MessageDigest::sha384(),
            DigestAlgorithm::Sha512 => MessageDigest::sha512(),
            DigestAlgorithm::Sha3_256 => MessageDigest::sha3_256(),
            DigestAlgorithm::Sha3_512 => MessageDigest::sha3_512(),
        }
    }
}

/// Get the subject common name from a certificate, if it has one.
pub fn common_name(certificate: &X509Ref) -> Option<String> {
    certificate
        .subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|name| name.to_string())
}

/// The lowercase hex SHA-256 fingerprint of a certificate.
pub fn fingerprint(certificate: &X509Ref) -> Result<String, openssl::error::ErrorStack> {
    let digest = certificate.digest(MessageDigest::sha256())?;
    Ok(digest.iter().map(|byte| format!("{byte:02x}")).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_names() {
        assert_eq!(
            DigestAlgorithm::Sha256,
            "SHA256".parse::<DigestAlgorithm>().unwrap()
        );
        assert_eq!(
            DigestAlgorithm::Sha3_512,
            "sha3_512".parse::<DigestAlgorithm>().unwrap()
        );
        assert!("md5".parse::<DigestAlgorithm>().is_err());
        for digest in [
            DigestAlgorithm::Sha256,
            DigestAlgorithm::Sha384,
            DigestAlgorithm::Sha512,
            DigestAlgorithm::Sha3_256,
            DigestAlgorithm::Sha3_512,
        ] {
            assert_eq!(digest, digest.as_str().parse().unwrap());
        }
    }

    #[test]
    fn reserved_query_parameters() {
        assert!(query::is_reserved("digest"));
        assert!(query::is_reserved("sigtype"));
        assert!(!query::is_reserved("armor"));
    }
}
