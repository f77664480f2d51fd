// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Sends a single HTTP request to a single server.

use std::{future::Future, pin::Pin, time::Duration};

use bytes::Bytes;
use http::{header, HeaderValue, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use openssl::ssl::SslConnector;
use tokio::net::TcpStream;
use tokio_openssl::SslStream;
use tracing::instrument;

use crate::error::{ClientError, ConnectionError};

/// Transacts one request against the server named in the request URI.
///
/// Implementations return the response regardless of its status; interpreting the status is
/// left to the caller.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: http::Request<Bytes>,
    ) -> impl Future<Output = Result<http::Response<Bytes>, ClientError>> + Send;
}

/// HTTP/1.1 over mutually-authenticated TLS, with a fresh connection per request.
#[derive(Clone)]
pub struct HttpsTransport {
    connector: SslConnector,
    connect_timeout: Duration,
}

impl std::fmt::Debug for HttpsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpsTransport")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl HttpsTransport {
    pub fn new(connector: SslConnector, connect_timeout: Duration) -> Self {
        Self {
            connector,
            connect_timeout,
        }
    }

    async fn connect(&self, host: &str, port: u16) -> Result<SslStream<TcpStream>, ClientError> {
        let tcp_stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| ConnectionError::Timeout(self.connect_timeout))?
        .map_err(ConnectionError::from)?;
        let ssl = self.connector.configure()?.into_ssl(host)?;
        let mut stream = SslStream::new(ssl, tcp_stream).map_err(ConnectionError::from)?;
        Pin::new(&mut stream)
            .connect()
            .await
            .map_err(ConnectionError::from)?;
        tracing::debug!(host, port, "TLS connection established");
        Ok(stream)
    }
}

impl Transport for HttpsTransport {
    #[instrument(skip_all, err, fields(method = %request.method(), uri = %request.uri()))]
    async fn send(
        &self,
        request: http::Request<Bytes>,
    ) -> Result<http::Response<Bytes>, ClientError> {
        let (mut parts, body) = request.into_parts();
        let host = parts
            .uri
            .host()
            .ok_or_else(|| anyhow::anyhow!("request URI {} has no host", parts.uri))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = parts.uri.port_u16().unwrap_or(443);
        if let Some(authority) = parts.uri.authority() {
            let host_header =
                HeaderValue::from_str(authority.as_str()).map_err(anyhow::Error::from)?;
            parts.headers.insert(header::HOST, host_header);
        }
        // HTTP/1.1 servers expect the origin-form of the target
        parts.uri = parts
            .uri
            .path_and_query()
            .cloned()
            .map(Uri::from)
            .unwrap_or_else(|| Uri::from_static("/"));

        let stream = self.connect(&host, port).await?;
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(ConnectionError::from)?;
        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::debug!(?error, "Connection to server closed with an error");
            }
        });

        let response = sender
            .send_request(http::Request::from_parts(parts, Full::new(body)))
            .await
            .map_err(ConnectionError::from)?;
        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(ConnectionError::from)?
            .to_bytes();
        tracing::debug!(status = %parts.status, length = body.len(), "Received response");

        Ok(http::Response::from_parts(parts, body))
    }
}
