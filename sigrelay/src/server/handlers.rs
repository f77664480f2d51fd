// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Request handlers for each endpoint.

use std::{convert::Infallible, sync::Arc};

use bytes::Bytes;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use tokio_util::{io::StreamReader, sync::CancellationToken};
use tracing::{instrument, Instrument};

use super::{
    invoke::{self, CommandInvoker, Invocation, InvocationOutcome, Peer},
    Config,
};
use crate::{
    compress::{self, DecodingReader, ACCEPTED_ENCODINGS},
    protocol::{self, query, ErrorResponse},
};

/// State shared by every request the server handles.
#[derive(Debug)]
pub(crate) struct State {
    pub config: Config,
    pub invoker: CommandInvoker,
}

/// Route a request to its handler.
///
/// Handlers never fail; errors are reported to the client as a JSON [`ErrorResponse`].
pub(crate) async fn route(
    state: Arc<State>,
    peer: Arc<Peer>,
    token: CancellationToken,
    request: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let request_id = uuid::Uuid::now_v7();
    let span = tracing::info_span!(
        "request",
        %request_id,
        method = %request.method(),
        path = request.uri().path(),
    );

    async move {
        let request_headers = request.headers().clone();
        let endpoint = request.uri().path().trim_start_matches('/').to_string();
        let response = match (request.method(), endpoint.as_str()) {
            (&Method::GET, protocol::DIRECTORY_ENDPOINT) => Ok(directory(&state.config)),
            (&Method::GET, protocol::LIST_KEYS_ENDPOINT) => Ok(list_keys(&state.config)),
            (&Method::GET, protocol::GET_KEY_ENDPOINT) => get_key(&state.config, &request).await,
            (&Method::POST, protocol::SIGN_ENDPOINT) => {
                sign(&state, &peer, &token, request).await
            }
            (&Method::GET, protocol::HEALTH_ENDPOINT) => {
                Ok(Response::new(Bytes::from_static(b"OK")))
            }
            (
                _,
                protocol::DIRECTORY_ENDPOINT
                | protocol::LIST_KEYS_ENDPOINT
                | protocol::GET_KEY_ENDPOINT
                | protocol::SIGN_ENDPOINT
                | protocol::HEALTH_ENDPOINT,
            ) => Err(HandlerError::new(
                StatusCode::METHOD_NOT_ALLOWED,
                "method not allowed",
            )),
            _ => Err(HandlerError::new(StatusCode::NOT_FOUND, "not found")),
        };

        let response = match response {
            Ok(mut response) => {
                if let Err(error) = compress::encode_response(&request_headers, &mut response) {
                    tracing::warn!(?error, "Failed to compress response; sending it uncompressed");
                }
                response
            }
            Err(error) => error.into_response(),
        };
        tracing::info!(status = response.status().as_u16(), "Request complete");
        Ok(response.map(Full::new))
    }
    .instrument(span)
    .await
}

/// An error reported to the client.
#[derive(Debug)]
struct HandlerError {
    status: StatusCode,
    message: String,
}

impl HandlerError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn internal(error: impl std::fmt::Debug) -> Self {
        tracing::error!(?error, "Request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
    }

    fn into_response(self) -> Response<Bytes> {
        let body = serde_json::to_vec(&ErrorResponse {
            status: self.status.as_u16(),
            message: self.message,
        })
        .unwrap_or_default();
        let mut response = Response::new(Bytes::from(body));
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        response
    }
}

fn query_pairs<B>(request: &Request<B>) -> Vec<(String, String)> {
    url::form_urlencoded::parse(request.uri().query().unwrap_or_default().as_bytes())
        .into_owned()
        .collect()
}

fn required<'a>(pairs: &'a [(String, String)], name: &str) -> Result<&'a str, HandlerError> {
    pairs
        .iter()
        .find(|(key, value)| key == name && !value.is_empty())
        .map(|(_, value)| value.as_str())
        .ok_or_else(|| {
            HandlerError::new(
                StatusCode::BAD_REQUEST,
                format!("missing '{name}' parameter"),
            )
        })
}

fn text_response(lines: impl IntoIterator<Item = impl AsRef<str>>) -> Response<Bytes> {
    let body = lines.into_iter().fold(String::new(), |mut body, line| {
        body.push_str(line.as_ref());
        body.push_str("\r\n");
        body
    });
    let mut response = Response::new(Bytes::from(body));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain"),
    );
    response
}

/// List the servers clients should send requests to, and the encodings this server accepts.
fn directory(config: &Config) -> Response<Bytes> {
    let mut response = text_response(&config.directory);
    response.headers_mut().insert(
        header::ACCEPT_ENCODING,
        HeaderValue::from_static(ACCEPTED_ENCODINGS),
    );
    response
}

fn list_keys(config: &Config) -> Response<Bytes> {
    text_response(config.keys.keys())
}

#[instrument(skip_all, err(Debug))]
async fn get_key<B>(config: &Config, request: &Request<B>) -> Result<Response<Bytes>, HandlerError> {
    let pairs = query_pairs(request);
    let name = required(&pairs, query::KEY)?;
    let key = config
        .keys
        .get(name)
        .ok_or_else(|| HandlerError::new(StatusCode::NOT_FOUND, format!("unknown key '{name}'")))?;
    let certificate = tokio::fs::read(&key.certificate)
        .await
        .map_err(HandlerError::internal)?;
    let mut response = Response::new(Bytes::from(certificate));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-pem-file"),
    );
    Ok(response)
}

/// Stream the request body to the signing tool and return what it prints.
#[instrument(skip_all, err(Debug), fields(key, sig_type))]
async fn sign(
    state: &State,
    peer: &Peer,
    token: &CancellationToken,
    request: Request<Incoming>,
) -> Result<Response<Bytes>, HandlerError> {
    let pairs = query_pairs(&request);
    let key = required(&pairs, query::KEY)?;
    let sig_type = required(&pairs, query::SIG_TYPE)?;
    tracing::Span::current().record("key", key);
    tracing::Span::current().record("sig_type", sig_type);
    if !state.config.keys.contains_key(key) {
        return Err(HandlerError::new(
            StatusCode::NOT_FOUND,
            format!("unknown key '{key}'"),
        ));
    }
    let encoding = compress::content_encoding(request.headers())
        .map_err(|error| HandlerError::new(StatusCode::NOT_ACCEPTABLE, error.to_string()))?;

    let mut command_line = state.config.signing_command.clone();
    command_line.extend(
        ["sign-stream", "--key", key, "--sig-type", sig_type].map(String::from),
    );
    for (name, value) in pairs.iter().filter(|(name, _)| !query::is_reserved(name)) {
        command_line.extend(["--param".to_string(), format!("{name}={value}")]);
    }
    let command_line = invoke::augment_command_line(command_line, &pairs, peer);

    let work_dir = tempfile::Builder::new()
        .prefix("request-")
        .tempdir_in(&state.config.work_directory)
        .map_err(HandlerError::internal)?;
    let invocation = Invocation {
        command_line,
        work_dir: work_dir.path().to_path_buf(),
        combined_output: state.config.combined_output,
        timeout: state.config.signing_timeout(),
    };

    // A body that ends before its declared length means the client hung up.
    let body = request.into_body().map_err(|error| {
        if error.is_incomplete_message() {
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, error)
        } else {
            std::io::Error::other(error)
        }
    });
    let reader = StreamReader::new(Box::pin(body.into_data_stream()));
    let reader = DecodingReader::new(reader, encoding);

    let outcome = state
        .invoker
        .invoke(token, Some(reader), &invocation)
        .await
        .map_err(HandlerError::internal)?;
    match outcome {
        InvocationOutcome::Success(signed) => {
            let mut response = Response::new(signed);
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );
            Ok(response)
        }
        InvocationOutcome::ToolError { status, message } => {
            Err(HandlerError::new(status, message))
        }
        InvocationOutcome::Timeout | InvocationOutcome::ClientHangup => Err(HandlerError::new(
            outcome.status(),
            "Signing command timed out",
        )),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::server::config::ServerKey;

    fn config() -> Config {
        Config {
            directory: vec![
                "https://a.example.com:6300/".to_string(),
                "https://b.example.com:6300/".to_string(),
            ],
            keys: BTreeMap::from([
                (
                    "release".to_string(),
                    ServerKey {
                        certificate: "/nonexistent/release.crt".into(),
                    },
                ),
                (
                    "nightly".to_string(),
                    ServerKey {
                        certificate: "/nonexistent/nightly.crt".into(),
                    },
                ),
            ]),
            ..Default::default()
        }
    }

    #[test]
    fn directory_listing() {
        let response = directory(&config());
        assert_eq!(ACCEPTED_ENCODINGS, response.headers()[header::ACCEPT_ENCODING]);
        assert_eq!(
            "https://a.example.com:6300/\r\nhttps://b.example.com:6300/\r\n",
            std::str::from_utf8(response.body()).unwrap()
        );
        assert_eq!(
            vec!["https://a.example.com:6300/", "https://b.example.com:6300/"],
            crate::client::directory::parse_listing(std::str::from_utf8(response.body()).unwrap())
        );
    }

    #[test]
    fn empty_directory() {
        let response = directory(&Config::default());
        assert!(response.body().is_empty());
        assert_eq!(ACCEPTED_ENCODINGS, response.headers()[header::ACCEPT_ENCODING]);
    }

    #[test]
    fn key_listing() {
        let response = list_keys(&config());
        assert_eq!(b"nightly\r\nrelease\r\n".as_slice(), response.body().as_ref());
    }

    #[tokio::test]
    async fn get_key_errors() {
        let config = config();
        let missing = Request::get("/get_key").body(()).unwrap();
        let error = get_key(&config, &missing).await.unwrap_err();
        assert_eq!(StatusCode::BAD_REQUEST, error.status);

        let unknown = Request::get("/get_key?key=other").body(()).unwrap();
        let error = get_key(&config, &unknown).await.unwrap_err();
        assert_eq!(StatusCode::NOT_FOUND, error.status);

        let unreadable = Request::get("/get_key?key=release").body(()).unwrap();
        let error = get_key(&config, &unreadable).await.unwrap_err();
        assert_eq!(StatusCode::INTERNAL_SERVER_ERROR, error.status);
    }

    #[tokio::test]
    async fn get_key_returns_certificate() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("release.crt");
        std::fs::write(&path, "-----BEGIN CERTIFICATE-----\n")?;
        let mut config = config();
        config.keys.insert(
            "release".to_string(),
            ServerKey {
                certificate: path.clone(),
            },
        );

        let request = Request::get("/get_key?key=release").body(())?;
        let response = get_key(&config, &request).await.unwrap();
        assert_eq!(
            b"-----BEGIN CERTIFICATE-----\n".as_slice(),
            response.body().as_ref()
        );
        Ok(())
    }

    #[test]
    fn error_body_is_json() -> anyhow::Result<()> {
        let response =
            HandlerError::new(StatusCode::NOT_ACCEPTABLE, "unsupported content encoding 'br'")
                .into_response();
        assert_eq!(StatusCode::NOT_ACCEPTABLE, response.status());
        let body: ErrorResponse = serde_json::from_slice(response.body())?;
        assert_eq!(406, body.status);
        assert_eq!("unsupported content encoding 'br'", body.message);
        Ok(())
    }

    #[test]
    fn query_parsing() {
        let request = Request::post("/sign?key=release&sigtype=raw&armor=true&filename=a%20b.txt")
            .body(())
            .unwrap();
        let pairs = query_pairs(&request);
        assert_eq!(Ok("release"), required(&pairs, query::KEY).map_err(|e| e.status));
        assert_eq!(Ok("a b.txt"), required(&pairs, query::FILENAME).map_err(|e| e.status));
        assert_eq!(
            Err(StatusCode::BAD_REQUEST),
            required(&pairs, query::DIGEST).map_err(|e| e.status)
        );
    }
}
