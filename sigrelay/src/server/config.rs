// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::{collections::BTreeMap, net::SocketAddr, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::config::Credentials;

/// Configuration for the sigrelay server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The address and port to accept HTTPS connections on.
    pub listen_address: SocketAddr,

    /// The credentials used to accept client connections. Clients must present a certificate
    /// issued by `ca_certificate`, and the server certificate must have `serverAuth` in its
    /// extended key usage extension.
    pub credentials: Credentials,

    /// The signing tool, as a program followed by its leading arguments.
    ///
    /// The server appends `sign-stream --key <key> --sig-type <type>`, a `--param name=value`
    /// pair for each format flag in the request, `--digest` and the client's `--attr`
    /// attributes, then writes the to-be-signed content to the tool's stdin. Whatever the tool
    /// writes to stdout is returned to the client.
    pub signing_command: Vec<String>,

    /// Seconds the signing tool may run before it is killed and the client is told the
    /// request timed out.
    pub signing_timeout: u64,

    /// A scratch directory is created in this directory for every signing request and used as
    /// the signing tool's working directory.
    pub work_directory: PathBuf,

    /// Include the tool's stdout as well as its stderr in the log when it fails.
    #[serde(default)]
    pub combined_output: bool,

    /// Base URLs returned by the `directory` endpoint. Clients configured with this server as
    /// their `directoryUrl` send their requests to these servers.
    #[serde(default)]
    pub directory: Vec<String>,

    /// The keys this server offers. The signing tool must be configured with keys of the same
    /// name.
    #[serde(default)]
    pub keys: BTreeMap<String, ServerKey>,

    /// The maximum number of signing tools to run at once. Requests beyond this wait for a
    /// running tool to exit. Unlimited if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_signers: Option<usize>,
}

/// A key offered by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerKey {
    /// The PEM-encoded certificate returned by the `get_key` endpoint.
    pub certificate: PathBuf,
}

impl Config {
    pub fn signing_timeout(&self) -> Duration {
        Duration::from_secs(self.signing_timeout)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from(([0, 0, 0, 0, 0, 0, 0, 0], 6300)),
            credentials: Credentials {
                private_key: PathBuf::from("sigrelay.server.private_key.pem"),
                certificate: PathBuf::from("sigrelay.server.certificate.pem"),
                ca_certificate: PathBuf::from("sigrelay.ca_certificate.pem"),
            },
            signing_command: vec![
                "sigrelay".to_string(),
                "--config".to_string(),
                "/etc/sigrelay/signer.toml".to_string(),
            ],
            signing_timeout: 60,
            work_directory: PathBuf::from("/var/lib/sigrelay/"),
            combined_output: false,
            directory: vec![],
            keys: BTreeMap::new(),
            max_concurrent_signers: None,
        }
    }
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
