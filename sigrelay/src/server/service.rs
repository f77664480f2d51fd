// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The sigrelay server.

use std::{net::SocketAddr, pin::Pin, sync::Arc, time::Duration};

use anyhow::Context;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use openssl::ssl::{Ssl, SslAcceptor};
use tokio::net::{TcpListener, TcpStream};
use tokio_openssl::SslStream;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{instrument, Instrument};

use crate::{
    protocol,
    server::{
        config::Config,
        handlers::{self, State},
        invoke::{CommandInvoker, Peer},
    },
};

/// A sigrelay server.
pub struct Server {
    state: Arc<State>,
    tls_config: SslAcceptor,
}

/// A running server, returned by [`Server::run`].
pub struct Listener {
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
    halt_token: CancellationToken,
    abort_token: CancellationToken,
    local_addr: SocketAddr,
}

impl Listener {
    /// Stop accepting new connections and wait for existing connections to complete.
    ///
    /// Existing connections can run for an arbitrarily long time, so users should wrap
    /// this call in a timeout if they don't have an arbitrarily long time to wait.
    pub async fn halt(self) -> anyhow::Result<()> {
        self.halt_token.cancel();
        self.task.await??;

        Ok(())
    }

    /// Stop accepting new connections and cancel in-progress requests.
    ///
    /// Running signing tools are killed and their clients receive a `504 Gateway Timeout`.
    pub async fn abort(self) -> anyhow::Result<()> {
        self.abort_token.cancel();
        self.halt_token.cancel();
        self.task.await??;

        Ok(())
    }

    /// Get a cancellation token which can be used to start the graceful shutdown of this
    /// listener.
    pub fn halt_token(&self) -> CancellationToken {
        self.halt_token.clone()
    }

    /// Get a token which, when cancelled, kills every running signing tool.
    ///
    /// It doesn't stop the listener; cancel the [`Listener::halt_token`] as well.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort_token.clone()
    }

    /// The address the server is accepting connections on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn wait_to_finish(self) -> anyhow::Result<()> {
        self.task.await??;
        Ok(())
    }
}

impl Server {
    /// Create a new server.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let tls_config = config.credentials.ssl_acceptor()?;
        std::fs::create_dir_all(&config.work_directory).with_context(|| {
            format!(
                "failed to create work directory {}",
                config.work_directory.display()
            )
        })?;
        let invoker = CommandInvoker::new(config.max_concurrent_signers);
        Ok(Self {
            state: Arc::new(State { config, invoker }),
            tls_config,
        })
    }

    /// Run the server.
    ///
    /// This must be called from within a Tokio runtime.
    #[instrument(skip_all, name = "server")]
    pub fn run(self) -> anyhow::Result<Listener> {
        let listen_address = self.state.config.listen_address;
        let listener = std::net::TcpListener::bind(listen_address)
            .with_context(|| format!("failed to listen on {listen_address}"))?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let local_addr = listener.local_addr()?;
        tracing::info!(%local_addr, "Accepting connections");

        let halt_token = CancellationToken::new();
        let abort_token = CancellationToken::new();
        let server_halt_token = halt_token.clone();
        let server_abort_token = abort_token.clone();
        let task = tokio::spawn(
            async move {
                let request_tracker = TaskTracker::new();
                loop {
                    let (tcp_stream, client_addr) = tokio::select! {
                        _ = server_halt_token.cancelled() => {
                            tracing::info!("Shutdown requested, no new requests will be accepted");
                            break;
                        },
                        conn = listener.accept() => match conn {
                            Ok(conn) => conn,
                            Err(error) => {
                                tracing::error!(?error, "Failed to accept incoming connection");
                                tokio::time::sleep(Duration::from_millis(100)).await;
                                continue;
                            }
                        },
                    };

                    let ssl = match Ssl::new(self.tls_config.context()) {
                        Ok(ssl) => ssl,
                        Err(error) => {
                            tracing::error!(?error, %client_addr, "Failed to set up TLS for connection");
                            continue;
                        }
                    };
                    request_tracker.spawn(
                        handle(
                            self.state.clone(),
                            ssl,
                            tcp_stream,
                            client_addr,
                            server_halt_token.clone(),
                            server_abort_token.child_token(),
                        )
                        .instrument(tracing::Span::current()),
                    );
                }

                tracing::debug!("Beginning shutdown");
                request_tracker.close();
                request_tracker.wait().await;
                tracing::info!("All pending requests are now complete");

                Ok::<_, anyhow::Error>(())
            }
            .instrument(tracing::Span::current()),
        );

        Ok(Listener {
            task,
            halt_token,
            abort_token,
            local_addr,
        })
    }
}

/// Authenticate a client and serve its requests until it disconnects or the server halts.
#[instrument(skip_all, err, fields(client_ip = %client_addr.ip(), client))]
async fn handle(
    state: Arc<State>,
    ssl: Ssl,
    tcp_stream: TcpStream,
    client_addr: SocketAddr,
    halt_token: CancellationToken,
    connection_token: CancellationToken,
) -> anyhow::Result<()> {
    let mut stream = SslStream::new(ssl, tcp_stream)?;
    Pin::new(&mut stream)
        .accept()
        .await
        .context("TLS handshake with client failed")?;
    let name = stream
        .ssl()
        .peer_certificate()
        .as_deref()
        .and_then(protocol::common_name)
        .ok_or_else(|| anyhow::anyhow!("client certificate has no common name"))?;
    tracing::Span::current().record("client", name.as_str());
    tracing::info!("Client authenticated");

    let peer = Arc::new(Peer {
        ip: client_addr.ip(),
        name,
    });
    // Requests run in their own tasks so that one still in progress when the connection
    // fails sees its token cancelled instead of being dropped with the connection.
    let requests = TaskTracker::new();
    let service = {
        let requests = requests.clone();
        let connection_token = connection_token.clone();
        service_fn(move |request| {
            let task = requests.spawn(
                handlers::route(
                    state.clone(),
                    peer.clone(),
                    connection_token.child_token(),
                    request,
                )
                .in_current_span(),
            );
            async move {
                task.await.map(|response| match response {
                    Ok(response) => response,
                    Err(never) => match never {},
                })
            }
        })
    };
    let connection = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = halt_token.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.as_mut().await
        }
    };

    // Anything still running has no client to answer.
    connection_token.cancel();
    requests.close();
    requests.wait().await;

    match result {
        Ok(()) => Ok(()),
        Err(error) if error.is_incomplete_message() || error.is_canceled() => {
            tracing::info!(?error, "Client disconnected");
            Ok(())
        }
        Err(error) => Err(error.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, path::Path, time::Instant};

    use bytes::Bytes;
    use tokio::io::AsyncWriteExt;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        client::{self, RemoteClient, RemoteConfig},
        config::Credentials,
        server::ServerKey,
        test_utils::TestPki,
    };

    fn server_config(pki: &TestPki, work_directory: &Path, tool_script: &str) -> anyhow::Result<Config> {
        Ok(Config {
            listen_address: "127.0.0.1:0".parse()?,
            credentials: Credentials {
                private_key: pki.server_key_path(),
                certificate: pki.server_certificate_path(),
                ca_certificate: pki.ca_certificate_path(),
            },
            signing_command: vec!["sh".to_string(), "-c".to_string(), tool_script.to_string()],
            signing_timeout: 25,
            work_directory: work_directory.to_path_buf(),
            keys: BTreeMap::from([(
                "release".to_string(),
                ServerKey {
                    certificate: pki.ca_certificate_path(),
                },
            )]),
            ..Default::default()
        })
    }

    fn client(pki: &TestPki, listener: &Listener) -> RemoteClient {
        RemoteClient::new(Arc::new(client::Config {
            remote: Some(RemoteConfig {
                url: Some(format!("https://localhost:{}/", listener.local_addr().port())),
                certfile: Some(pki.client_certificate_path().display().to_string()),
                keyfile: Some(pki.client_key_path().display().to_string()),
                cacert: Some(pki.ca_certificate_path().display().to_string()),
                connect_timeout: 5,
                ..Default::default()
            }),
            ..Default::default()
        }))
    }

    async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        condition()
    }

    #[tokio::test]
    #[traced_test]
    async fn client_disconnect_kills_tool() -> anyhow::Result<()> {
        let pki = TestPki::new()?;
        let dir = tempfile::TempDir::new()?;
        let pid_file = dir.path().join("tool.pid");
        let script = format!(
            "cat >/dev/null; echo $$ > {}; exec sleep 30",
            pid_file.display()
        );
        let listener =
            Server::new(server_config(&pki, &dir.path().join("work"), &script)?)?.run()?;
        let client = client(&pki, &listener);

        let request = tokio::spawn(async move {
            client
                .sign(
                    "release",
                    "raw",
                    None,
                    None,
                    &BTreeMap::new(),
                    &Bytes::from_static(b"content"),
                )
                .await
        });
        assert!(
            eventually(|| std::fs::read_to_string(&pid_file).is_ok_and(|pid| pid.ends_with('\n')))
                .await,
            "signing tool never started"
        );
        let pid = std::fs::read_to_string(&pid_file)?.trim().to_string();
        request.abort();

        let process = std::path::PathBuf::from(format!("/proc/{pid}"));
        assert!(
            eventually(|| !process.exists()).await,
            "signing tool outlived its client"
        );
        assert!(eventually(|| logs_contain("client hung up during signing operation")).await);
        assert!(!logs_contain("command timed out"));

        listener.halt().await?;
        Ok(())
    }

    #[tokio::test]
    async fn failed_handshake_leaves_listener_running() -> anyhow::Result<()> {
        let pki = TestPki::new()?;
        let dir = tempfile::TempDir::new()?;
        let listener =
            Server::new(server_config(&pki, &dir.path().join("work"), "cat")?)?.run()?;

        let mut stream = TcpStream::connect(listener.local_addr()).await?;
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await?;
        drop(stream);

        let keys = client(&pki, &listener).list_keys().await?;
        assert_eq!(vec!["release"], keys);

        listener.halt().await?;
        Ok(())
    }
}
