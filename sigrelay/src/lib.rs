// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

/*!
# Sigrelay

Sigrelay is a code-signing service. Signing keys live on one or more signing servers, which are
reachable only by clients presenting a TLS certificate issued by the deployment's certificate
authority. Clients either sign locally with a key configured on their own host, or they send the
content to be signed to a server, which performs the signature with an external signing tool
(typically `sigrelay sign-stream` configured with the server's keys) and returns the result.

## Components

The client ([`client::RemoteClient`]) locates servers, optionally through a directory endpoint
that lists the live servers, and fails over between them when a server is unreachable or
temporarily unable to serve requests. Request and response bodies are compressed when both sides
support it.

The server ([`server::service::Server`]) authenticates clients with mutual TLS, runs the
configured signing tool for each request under a deadline, and tells apart a tool failure, a tool
timeout, and a client hanging up mid-request.

The signing pipeline ([`signing::Session`]) ties the two together: it picks a format module for
the input, acquires the key, produces the bytes to sign, signs them locally or remotely, merges
the signature back into the artifact, writes the output atomically, and records an audit entry.

## Crate features

* **cli** -
  Include the `sigrelay` and `sigrelay-server` command-line interfaces. This is a default
  feature.
*/

pub mod client;
pub mod compress;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod signing;

#[cfg(test)]
pub(crate) mod test_utils;
