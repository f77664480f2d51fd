// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Error types for the sigrelay client and server.

use std::time::Duration;

use http::StatusCode;

use crate::protocol::ErrorResponse;

/// Implemented by errors that know whether retrying the operation against another server may
/// succeed.
pub trait Temporary {
    /// Returns true if the error is likely to go away by itself, for example because a server
    /// is restarting or the network hiccupped.
    fn is_temporary(&self) -> bool;
}

/// The client configuration is unusable.
///
/// These errors are never retried; the configuration must be fixed.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The configuration file has no `[remote]` section.
    #[error("config file has no \"remote\" section")]
    MissingRemote,

    /// Neither `url` nor `directoryUrl` is set.
    #[error("url or directoryUrl must be set in 'remote' section of configuration")]
    MissingTarget,

    /// The client certificate or its private key is not configured.
    #[error("certfile and keyfile are required settings in 'remote' section of configuration")]
    MissingCredentials,

    /// A server URL uses a scheme other than `https`.
    #[error("server URL '{0}' must use https")]
    UnsupportedScheme(String),
}

/// Errors that occur while establishing a connection or transacting a request on it.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConnectionError {
    /// An I/O occurred.
    ///
    /// This is very likely due to temporary networking issues and the request is tried against
    /// the next server. Be aware, however, that it could be because the configured hostname or
    /// port is incorrect, in which case retrying will never succeed.
    #[error("an I/O error occurred: {0}")]
    Io(std::io::Error),

    /// The TCP connection was not established within the configured connect timeout.
    #[error("connection not established within {0:?}")]
    Timeout(Duration),

    /// One or more OpenSSL errors occurred.
    ///
    /// This is most commonly a certificate verification failure; retrying is not recommended.
    #[error("one or more openssl errors occurred: {0}")]
    SslErrors(#[from] openssl::error::ErrorStack),

    /// The TLS connection to the server failed.
    ///
    /// This could be due to a protocol level failure, like a handshake failure due to no common
    /// supported versions/ciphers/etc, or because the TLS certificate is incorrect, or due to a
    /// network-level failure. Only the network-level failures are considered temporary.
    #[error("an SSL error occurred: {0}")]
    Ssl(#[from] openssl::ssl::Error),

    /// The HTTP exchange failed.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

impl From<std::io::Error> for ConnectionError {
    fn from(error: std::io::Error) -> Self {
        // I/O errors may occur due to a TLS error, like if the server rejects the client certificate
        // but then the client reads from the socket. Map those type of errors to our more specific
        // error variants.
        if let Some(ssl_error) = std::error::Error::source(&error)
            .and_then(|error| error.downcast_ref::<openssl::error::ErrorStack>())
        {
            ConnectionError::Ssl(ssl_error.to_owned().into())
        } else {
            ConnectionError::Io(error)
        }
    }
}

impl Temporary for ConnectionError {
    fn is_temporary(&self) -> bool {
        match self {
            ConnectionError::Io(_) | ConnectionError::Timeout(_) => true,
            ConnectionError::SslErrors(_) => false,
            ConnectionError::Ssl(error) => error.io_error().is_some(),
            ConnectionError::Http(error) => {
                error.is_closed()
                    || error.is_incomplete_message()
                    || error.is_timeout()
                    || std::error::Error::source(error)
                        .is_some_and(|source| source.is::<std::io::Error>())
            }
        }
    }
}

/// The server answered a request with a failure status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("server responded with {status}: {message}")]
pub struct ServerError {
    pub status: StatusCode,
    pub message: String,
}

impl ServerError {
    /// Build an error from a failed response.
    ///
    /// The body is expected to be a JSON [`ErrorResponse`], but anything else is tolerated and
    /// used as the message verbatim so proxies in front of the server produce useful errors too.
    pub fn from_response(status: StatusCode, body: &[u8]) -> Self {
        let message = match serde_json::from_slice::<ErrorResponse>(body) {
            Ok(response) => response.message,
            Err(_) => String::from_utf8_lossy(body).trim().to_string(),
        };
        Self { status, message }
    }
}

impl Temporary for ServerError {
    fn is_temporary(&self) -> bool {
        matches!(
            self.status,
            StatusCode::INTERNAL_SERVER_ERROR
                | StatusCode::BAD_GATEWAY
                | StatusCode::SERVICE_UNAVAILABLE
                | StatusCode::GATEWAY_TIMEOUT
                | StatusCode::INSUFFICIENT_STORAGE
        )
    }
}

/// Errors the [`crate::client::RemoteClient`] may return.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ClientError {
    /// The remote configuration is incomplete. Retrying will not help.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The client certificate, private key, or CA certificate could not be read or parsed.
    #[error("remote.{setting}: {source}")]
    CredentialLoad {
        setting: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Returned in the event that the OpenSSL configuration derived from the remote configuration
    /// is invalid or otherwise disagreeable to OpenSSL.
    ///
    /// This error is not returned for an OpenSSL-related error during the connection, so retrying
    /// is not appropriate.
    #[error("openssl could not be configured: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),

    /// A server URL, or an endpoint resolved against it, is not a valid URL.
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Returned in the event that an error occurred while communicating with a server. Refer to
    /// [`ConnectionError`] for details on which errors are temporary.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Errors the server returned for a particular request.
    ///
    /// Statuses 500, 502, 503, 504 and 507 are temporary and are retried against the next
    /// server. Every other status, including the rest of 5xx, is permanent.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// A general I/O error occurred, unrelated to the underlying network connection. It is likely
    /// due to a request body that could not be read.
    #[error("an I/O error occurred: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error that indicates a fatal error, likely due to a bug in the client.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl Temporary for ClientError {
    fn is_temporary(&self) -> bool {
        match self {
            ClientError::Connection(error) => error.is_temporary(),
            ClientError::Server(error) => error.is_temporary(),
            _ => false,
        }
    }
}
