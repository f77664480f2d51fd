// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Server discovery through a directory endpoint.

use http::{header, Method};
use tracing::instrument;

use super::{failover, transport::Transport, RequestDescriptor};
use crate::{error::ClientError, protocol::DIRECTORY_ENDPOINT};

/// The servers a directory lists, and the encodings it advertised for requests to them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Candidates {
    pub bases: Vec<String>,
    pub encodings: String,
}

/// Ask the directory at `directory_url` for the list of live servers.
///
/// The request is made without compression, through the same failover loop as any other
/// request but with the directory as the only candidate. An empty list means the caller should
/// fall back to its configured URL.
///
/// # Errors
///
/// Any error contacting the directory is returned; the caller should not fall back to its
/// configured URL in that case.
#[instrument(skip(transport), err)]
pub async fn resolve<T: Transport>(
    transport: &T,
    directory_url: &str,
    retries: usize,
) -> Result<Candidates, ClientError> {
    let request = RequestDescriptor::new(DIRECTORY_ENDPOINT, Method::GET);
    let bases = super::expand_candidates(&[directory_url.to_string()], retries);
    let response = failover(transport, &bases, &request, String::new()).await?;
    let encodings = response
        .headers()
        .get(header::ACCEPT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let bases = parse_listing(&String::from_utf8_lossy(response.body()));
    tracing::debug!(?bases, encodings, "Resolved server directory");

    Ok(Candidates { bases, encodings })
}

/// Split a newline-separated listing, as returned by the directory and key listing endpoints.
pub fn parse_listing(body: &str) -> Vec<String> {
    body.trim_matches(['\r', '\n'])
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect()
}
