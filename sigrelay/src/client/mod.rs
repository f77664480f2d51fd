// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The sigrelay client.
//!
//! [`RemoteClient`] makes requests to signing servers. Each logical call resolves the set of
//! candidate servers, then tries them in order until one succeeds, a non-retryable error
//! occurs, or the candidates run out.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use http::{header, Method, StatusCode};
use openssl::x509::X509;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use url::Url;

use crate::{
    compress::{self, ACCEPTED_ENCODINGS},
    error::{ClientError, ConfigError, ServerError, Temporary},
    protocol::{self, query, DigestAlgorithm},
    signing::{audit::AuditConfig, token::KeyConfig},
};

mod body;
pub mod directory;
pub mod tls;
pub mod transport;

pub use body::{BodySource, FileBody};
pub(crate) use body::read_body;
pub use transport::{HttpsTransport, Transport};

/// Configuration for the sigrelay client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How to reach the signing servers. Required for any remote operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteConfig>,
    /// Signing keys, by name.
    pub keys: BTreeMap<String, KeyConfig>,
    /// Where to record audit entries for signatures made.
    pub audit: AuditConfig,
}

#[cfg(feature = "cli")]
impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&self).unwrap_or_default()
        )
    }
}

/// Connection settings for the signing servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// The base URL of the signing server.
    ///
    /// Used directly when no `directoryUrl` is set, and as the fallback when the directory
    /// lists no servers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// The base URL of a server whose `directory` endpoint lists the live signing servers.
    #[serde(rename = "directoryUrl", skip_serializing_if = "Option::is_none")]
    pub directory_url: Option<String>,
    /// The client certificate, either as a path or as inline PEM.
    ///
    /// Any certificates after the first are sent as intermediates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certfile: Option<String>,
    /// The private key matching `certfile`, either as a path or as inline PEM.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keyfile: Option<String>,
    /// The certificate authorities to trust for server certificates, either as a path or as
    /// inline PEM. The system trust store is used when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cacert: Option<String>,
    /// Seconds to wait for a TCP connection to be established before trying the next server.
    #[serde(rename = "connectTimeout")]
    pub connect_timeout: u64,
    /// The minimum number of attempts per call.
    ///
    /// If there are fewer servers than this, the list is repeated until there are enough.
    pub retries: usize,
    /// Append TLS session keys to this file in the NSS key log format. For debugging only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keylog_file: Option<PathBuf>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: None,
            directory_url: None,
            certfile: None,
            keyfile: None,
            cacert: None,
            connect_timeout: 15,
            retries: 1,
            keylog_file: None,
        }
    }
}

impl RemoteConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// The number of attempts to make; never less than one.
    pub fn retries(&self) -> usize {
        self.retries.max(1)
    }
}

/// A request to be made against whichever server is available.
#[derive(Clone)]
pub struct RequestDescriptor<'a> {
    /// The endpoint, resolved relative to each server's base URL.
    pub endpoint: &'a str,
    pub method: Method,
    pub query: &'a [(String, String)],
    pub body: Option<&'a dyn BodySource>,
}

impl<'a> RequestDescriptor<'a> {
    pub fn new(endpoint: &'a str, method: Method) -> Self {
        Self {
            endpoint,
            method,
            query: &[],
            body: None,
        }
    }

    pub fn with_query(mut self, query: &'a [(String, String)]) -> Self {
        self.query = query;
        self
    }

    pub fn with_body(mut self, body: &'a dyn BodySource) -> Self {
        self.body = Some(body);
        self
    }
}

/// Repeat the list of servers until it holds at least `retries` entries.
pub fn expand_candidates(bases: &[String], retries: usize) -> Vec<String> {
    let mut expanded = bases.to_vec();
    if bases.is_empty() {
        return expanded;
    }
    while expanded.len() < retries {
        expanded.extend_from_slice(bases);
    }
    expanded
}

/// The states of the failover loop.
#[derive(Debug)]
enum Failover {
    /// Send the request to the candidate at this index.
    TryCandidate(usize),
    /// The candidate rejected the request encoding; send it again without compression.
    RetryUncompressed(usize),
    Success(http::Response<Bytes>),
    /// The last candidate failed with a temporary error.
    Exhausted(ClientError),
    /// A candidate failed with an error that no other candidate will fix.
    PermanentFailure(ClientError),
}

/// Decide what to do after an attempt against the candidate at `index`.
fn transition(
    index: usize,
    candidates: &[String],
    compressed: bool,
    outcome: Result<http::Response<Bytes>, ClientError>,
) -> Failover {
    let error = match outcome {
        Ok(response) if response.status().as_u16() < 300 => return Failover::Success(response),
        Ok(response) if response.status() == StatusCode::NOT_ACCEPTABLE && compressed => {
            return Failover::RetryUncompressed(index)
        }
        Ok(mut response) => {
            if let Err(error) = compress::decode_response(&mut response) {
                tracing::debug!(?error, "Unable to decode error response body");
            }
            ClientError::Server(ServerError::from_response(
                response.status(),
                response.body(),
            ))
        }
        Err(error) => error,
    };

    if !error.is_temporary() {
        Failover::PermanentFailure(error)
    } else if index + 1 < candidates.len() {
        tracing::warn!(
            %error,
            server = %candidates[index],
            "Unable to complete request; trying next server"
        );
        Failover::TryCandidate(index + 1)
    } else {
        Failover::Exhausted(error)
    }
}

async fn build_request(
    base: &str,
    request: &RequestDescriptor<'_>,
    encodings: &str,
) -> Result<http::Request<Bytes>, ClientError> {
    let url = Url::parse(base)?;
    if url.scheme() != "https" {
        return Err(ConfigError::UnsupportedScheme(base.to_string()).into());
    }
    let mut url = url.join(request.endpoint)?;
    if !request.query.is_empty() {
        url.query_pairs_mut()
            .clear()
            .extend_pairs(request.query.iter());
    }
    let body = match request.body {
        Some(source) => read_body(source).await?,
        None => Bytes::new(),
    };
    let mut http_request = http::Request::builder()
        .method(request.method.clone())
        .uri(url.as_str())
        .header(header::USER_AGENT, protocol::USER_AGENT)
        .body(body)
        .map_err(anyhow::Error::from)?;
    compress::encode_request(&mut http_request, encodings)?;

    Ok(http_request)
}

/// Send `request` to each candidate in turn until one succeeds.
///
/// A fresh request, including a fresh body, is built for every attempt. Successful response
/// bodies are decompressed before they're returned.
pub(crate) async fn failover<T: Transport>(
    transport: &T,
    candidates: &[String],
    request: &RequestDescriptor<'_>,
    mut encodings: String,
) -> Result<http::Response<Bytes>, ClientError> {
    if candidates.is_empty() {
        return Err(ConfigError::MissingTarget.into());
    }

    let mut state = Failover::TryCandidate(0);
    loop {
        state = match state {
            Failover::TryCandidate(index) => {
                let http_request = build_request(&candidates[index], request, &encodings).await?;
                let outcome = transport.send(http_request).await;
                transition(index, candidates, !encodings.is_empty(), outcome)
            }
            Failover::RetryUncompressed(index) => {
                tracing::info!(
                    server = %candidates[index],
                    "Server does not accept the request encoding; retrying without compression"
                );
                encodings.clear();
                let http_request = build_request(&candidates[index], request, &encodings).await?;
                let outcome = transport.send(http_request).await;
                transition(index, candidates, false, outcome)
            }
            Failover::Success(mut response) => {
                compress::decode_response(&mut response)?;
                return Ok(response);
            }
            Failover::Exhausted(error) => {
                tracing::error!(%error, "All servers failed");
                return Err(error);
            }
            Failover::PermanentFailure(error) => return Err(error),
        }
    }
}

/// A client for the signing servers.
///
/// The client holds no connections; the TLS configuration is built from the configuration
/// on every call, so rotated credentials on disk are picked up immediately.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    config: Arc<Config>,
}

impl RemoteClient {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Get a reference to the client configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    fn remote(&self) -> Result<&RemoteConfig, ClientError> {
        self.config
            .remote
            .as_ref()
            .ok_or(ClientError::Config(ConfigError::MissingRemote))
    }

    /// Make a request to an endpoint, handling server discovery and failover.
    #[instrument(skip_all, err, fields(endpoint = request.endpoint, method = %request.method))]
    pub async fn call(
        &self,
        request: &RequestDescriptor<'_>,
    ) -> Result<http::Response<Bytes>, ClientError> {
        let remote = self.remote()?;
        let transport = HttpsTransport::new(tls::build(remote)?, remote.connect_timeout());
        self.call_with(&transport, request).await
    }

    /// Like [`RemoteClient::call`], but over the given transport.
    pub async fn call_with<T: Transport>(
        &self,
        transport: &T,
        request: &RequestDescriptor<'_>,
    ) -> Result<http::Response<Bytes>, ClientError> {
        let remote = self.remote()?;
        let mut encodings = ACCEPTED_ENCODINGS.to_string();
        let mut bases: Vec<String> = remote
            .url
            .iter()
            .filter(|url| !url.trim().is_empty())
            .cloned()
            .collect();
        if let Some(directory_url) = remote
            .directory_url
            .as_deref()
            .filter(|url| !url.trim().is_empty())
        {
            let candidates = directory::resolve(transport, directory_url, remote.retries()).await?;
            if !candidates.bases.is_empty() {
                bases = candidates.bases;
            }
            encodings = candidates.encodings;
        }
        if bases.is_empty() {
            return Err(ConfigError::MissingTarget.into());
        }

        let bases = expand_candidates(&bases, remote.retries());
        failover(transport, &bases, request, encodings).await
    }

    /// List the names of the keys the server offers.
    pub async fn list_keys(&self) -> Result<Vec<String>, ClientError> {
        let response = self
            .call(&RequestDescriptor::new(
                protocol::LIST_KEYS_ENDPOINT,
                Method::GET,
            ))
            .await?;
        Ok(directory::parse_listing(&String::from_utf8_lossy(
            response.body(),
        )))
    }

    /// Get the certificate of a key the server offers.
    pub async fn get_certificate(&self, key: &str) -> Result<X509, ClientError> {
        let query = [(query::KEY.to_string(), key.to_string())];
        let response = self
            .call(&RequestDescriptor::new(protocol::GET_KEY_ENDPOINT, Method::GET).with_query(&query))
            .await?;
        X509::from_pem(response.body()).map_err(|error| {
            ClientError::Fatal(anyhow::anyhow!(
                "server returned an invalid certificate for key {key}: {error}"
            ))
        })
    }

    /// Have the server sign content with a key, returning the signed bytes.
    ///
    /// `flags` are passed to the format module on the server unchanged.
    pub async fn sign(
        &self,
        key: &str,
        sig_type: &str,
        digest: Option<DigestAlgorithm>,
        filename: Option<&str>,
        flags: &BTreeMap<String, String>,
        body: &dyn BodySource,
    ) -> Result<Bytes, ClientError> {
        let query = sign_query(key, sig_type, digest, filename, flags);
        let response = self
            .call(
                &RequestDescriptor::new(protocol::SIGN_ENDPOINT, Method::POST)
                    .with_query(&query)
                    .with_body(body),
            )
            .await?;
        Ok(response.into_body())
    }
}

fn sign_query(
    key: &str,
    sig_type: &str,
    digest: Option<DigestAlgorithm>,
    filename: Option<&str>,
    flags: &BTreeMap<String, String>,
) -> Vec<(String, String)> {
    let mut query = vec![
        (query::KEY.to_string(), key.to_string()),
        (query::SIG_TYPE.to_string(), sig_type.to_string()),
    ];
    if let Some(digest) = digest {
        query.push((query::DIGEST.to_string(), digest.to_string()));
    }
    if let Some(filename) = filename {
        query.push((query::FILENAME.to_string(), filename.to_string()));
    }
    query.extend(
        flags
            .iter()
            .filter(|(name, _)| !query::is_reserved(name))
            .map(|(name, value)| (name.clone(), value.clone())),
    );
    query
}
