// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Run the signing tool for a request.
//!
//! The tool runs under a deadline and is tied to the request's cancellation token. When the
//! client disconnects before its request body is complete, the token is cancelled and the tool
//! is killed, and the failure is reported as a hang-up rather than a tool error.

use std::{
    net::IpAddr,
    path::PathBuf,
    pin::Pin,
    process::Stdio,
    sync::Arc,
    task::{ready, Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use http::StatusCode;
use tokio::{
    io::{AsyncRead, AsyncReadExt, ReadBuf},
    process::Command,
    sync::Semaphore,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{protocol::query, signing::audit::attr};

/// How long to wait for the tool's output pipes to close once it has exited.
const OUTPUT_GRACE: Duration = Duration::from_secs(5);

/// The marker the signing tool prints when a key can't make the requested kind of signature.
const NO_CERTIFICATE_MARKER: &str = "no certificate of type";

/// A single run of the signing tool.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// The program followed by its arguments.
    pub command_line: Vec<String>,
    pub work_dir: PathBuf,
    /// Log stdout as well as stderr when the tool fails.
    pub combined_output: bool,
    pub timeout: Duration,
}

/// How a run of the signing tool ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    /// The tool exited successfully; this is its stdout.
    Success(Bytes),
    /// The tool failed. The status and message are what the client is told.
    ToolError {
        status: StatusCode,
        message: &'static str,
    },
    /// The tool was killed because it ran past its deadline.
    Timeout,
    /// The tool was killed because the client went away.
    ClientHangup,
}

impl InvocationOutcome {
    /// The HTTP status reported to the client.
    pub fn status(&self) -> StatusCode {
        match self {
            InvocationOutcome::Success(_) => StatusCode::OK,
            InvocationOutcome::ToolError { status, .. } => *status,
            InvocationOutcome::Timeout | InvocationOutcome::ClientHangup => {
                StatusCode::GATEWAY_TIMEOUT
            }
        }
    }
}

/// Runs signing tools, optionally limiting how many run at once.
#[derive(Debug, Clone, Default)]
pub struct CommandInvoker {
    admission: Option<Arc<Semaphore>>,
}

impl CommandInvoker {
    pub fn new(max_concurrent: Option<usize>) -> Self {
        Self {
            admission: max_concurrent.map(|permits| Arc::new(Semaphore::new(permits.max(1)))),
        }
    }

    /// Run the tool, writing `stdin` to it if provided.
    ///
    /// Cancelling `parent` kills the tool. If `stdin` fails with
    /// [`std::io::ErrorKind::UnexpectedEof`], the client is assumed to have hung up and the
    /// tool is killed as well.
    #[instrument(skip_all, err, fields(program = invocation.command_line.first().map(String::as_str)))]
    pub async fn invoke<R>(
        &self,
        parent: &CancellationToken,
        stdin: Option<R>,
        invocation: &Invocation,
    ) -> std::io::Result<InvocationOutcome>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let token = parent.child_token();
        let _permit = match &self.admission {
            Some(admission) => tokio::select! {
                permit = admission.clone().acquire_owned() => {
                    Some(permit.map_err(std::io::Error::other)?)
                }
                _ = token.cancelled() => {
                    tracing::error!("client hung up while waiting to start the signing tool");
                    return Ok(InvocationOutcome::ClientHangup);
                }
            },
            None => None,
        };

        let (program, args) = invocation.command_line.split_first().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty signing command")
        })?;
        let mut child = Command::new(program)
            .args(args)
            .current_dir(&invocation.work_dir)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        tracing::debug!(pid = child.id(), "Started signing tool");

        let stdout = collect(child.stdout.take());
        let stderr = collect(child.stderr.take());
        let pump = match (stdin, child.stdin.take()) {
            (Some(reader), Some(mut pipe)) => {
                let mut reader = HangupDetector::new(reader, token.clone());
                Some(tokio::spawn(async move {
                    let result = tokio::io::copy(&mut reader, &mut pipe).await;
                    drop(pipe);
                    if let Err(error) = result {
                        tracing::debug!(?error, "Stopped writing to the signing tool");
                    }
                }))
            }
            _ => None,
        };

        let mut timed_out = false;
        let exited = tokio::select! {
            status = child.wait() => Some(status?),
            _ = tokio::time::sleep(invocation.timeout) => {
                timed_out = true;
                None
            }
            _ = token.cancelled() => None,
        };
        let status = match exited {
            Some(status) => status,
            None => {
                if let Err(error) = child.kill().await {
                    tracing::warn!(?error, "Failed to kill the signing tool");
                }
                child.wait().await?
            }
        };
        if let Some(pump) = pump {
            pump.abort();
        }
        let stdout = finish(stdout).await;
        let stderr = finish(stderr).await;

        if status.success() && !timed_out && !token.is_cancelled() {
            return Ok(InvocationOutcome::Success(stdout.into()));
        }

        let stderr = String::from_utf8_lossy(&stderr);
        let output = if invocation.combined_output {
            format!("{}{}", String::from_utf8_lossy(&stdout), stderr)
        } else {
            stderr.to_string()
        };
        let command = format_command_line(&invocation.command_line);
        if timed_out {
            tracing::error!(
                timeout = invocation.timeout.as_secs(),
                command,
                output,
                "command timed out"
            );
            Ok(InvocationOutcome::Timeout)
        } else if token.is_cancelled() {
            tracing::error!(command, "client hung up during signing operation");
            Ok(InvocationOutcome::ClientHangup)
        } else if stderr.contains(NO_CERTIFICATE_MARKER) {
            tracing::error!(%status, command, output, "signing tool failed");
            Ok(InvocationOutcome::ToolError {
                status: StatusCode::BAD_REQUEST,
                message: "key does not support signatures of this type",
            })
        } else {
            tracing::error!(%status, command, output, "signing tool failed");
            Ok(InvocationOutcome::ToolError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: "Internal Server Error",
            })
        }
    }
}

fn collect<R>(pipe: Option<R>) -> Option<JoinHandle<std::io::Result<Vec<u8>>>>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    pipe.map(|mut pipe| {
        tokio::spawn(async move {
            let mut output = vec![];
            pipe.read_to_end(&mut output).await?;
            Ok(output)
        })
    })
}

// Processes the tool started may hold its pipes open after it exits, so the output is
// collected with a bound.
async fn finish(task: Option<JoinHandle<std::io::Result<Vec<u8>>>>) -> Vec<u8> {
    let Some(mut task) = task else {
        return vec![];
    };
    match tokio::time::timeout(OUTPUT_GRACE, &mut task).await {
        Ok(Ok(Ok(output))) => output,
        Ok(Ok(Err(error))) => {
            tracing::warn!(?error, "Failed to read signing tool output");
            vec![]
        }
        Ok(Err(error)) => {
            tracing::warn!(?error, "Signing tool output reader failed");
            vec![]
        }
        Err(_) => {
            task.abort();
            tracing::warn!("Signing tool output was not closed after it exited");
            vec![]
        }
    }
}

/// Cancels a token when the wrapped reader ends before it should.
///
/// Request bodies that stop short of their declared length surface as
/// [`std::io::ErrorKind::UnexpectedEof`]; this is how a client hanging up mid-request is
/// noticed while its content is being streamed to the signing tool.
pub struct HangupDetector<R> {
    inner: R,
    token: CancellationToken,
}

impl<R> HangupDetector<R> {
    pub fn new(inner: R, token: CancellationToken) -> Self {
        Self { inner, token }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HangupDetector<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let result = ready!(Pin::new(&mut this.inner).poll_read(cx, buf));
        if let Err(error) = &result {
            if error.kind() == std::io::ErrorKind::UnexpectedEof {
                this.token.cancel();
            }
        }
        Poll::Ready(result)
    }
}

/// The client a request came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub ip: IpAddr,
    /// The common name of the client's certificate.
    pub name: String,
}

/// Append the digest and the client's identity to a signing tool command line.
///
/// The filename and digest come from the request's query; the address and name come from the
/// connection and can't be supplied by the client.
pub fn augment_command_line(
    mut command_line: Vec<String>,
    request_query: &[(String, String)],
    peer: &Peer,
) -> Vec<String> {
    let value = |name: &str| {
        request_query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
            .filter(|value| !value.is_empty())
    };
    if let Some(digest) = value(query::DIGEST) {
        command_line.extend(["--digest".to_string(), digest.to_string()]);
    }
    if let Some(filename) = value(query::FILENAME) {
        command_line.extend([
            "--attr".to_string(),
            format!("{}={filename}", attr::CLIENT_FILENAME),
        ]);
    }
    command_line.extend([
        "--attr".to_string(),
        format!("{}={}", attr::CLIENT_IP, peer.ip),
        "--attr".to_string(),
        format!("{}={}", attr::CLIENT_NAME, peer.name),
    ]);
    command_line
}

/// Render a command line for logs, quoting words that contain spaces.
pub fn format_command_line(command_line: &[String]) -> String {
    command_line
        .iter()
        .map(|word| {
            if word.contains(' ') {
                format!("\"{word}\"")
            } else {
                word.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use tracing_test::traced_test;

    use super::*;
    use crate::test_utils::TruncatedReader;

    fn shell(script: &str, work_dir: &std::path::Path, timeout: Duration) -> Invocation {
        Invocation {
            command_line: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            work_dir: work_dir.to_path_buf(),
            combined_output: false,
            timeout,
        }
    }

    #[tokio::test]
    async fn stdin_is_piped_to_tool() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let outcome = CommandInvoker::default()
            .invoke(
                &CancellationToken::new(),
                Some(b"to be signed".as_slice()),
                &shell("cat; echo; pwd -P", dir.path(), Duration::from_secs(10)),
            )
            .await?;

        let expected = format!("to be signed\n{}\n", dir.path().canonicalize()?.display());
        assert_eq!(InvocationOutcome::Success(Bytes::from(expected)), outcome);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn deadline_kills_tool() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let started = Instant::now();
        let outcome = CommandInvoker::default()
            .invoke::<&[u8]>(
                &CancellationToken::new(),
                None,
                &shell(
                    "echo $$ > pid; exec sleep 30",
                    dir.path(),
                    Duration::from_millis(300),
                ),
            )
            .await?;

        assert_eq!(InvocationOutcome::Timeout, outcome);
        assert_eq!(StatusCode::GATEWAY_TIMEOUT, outcome.status());
        assert!(started.elapsed() < Duration::from_secs(10));
        let pid = std::fs::read_to_string(dir.path().join("pid"))?;
        assert!(!std::path::Path::new(&format!("/proc/{}", pid.trim())).exists());
        assert!(logs_contain("command timed out"));
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn truncated_body_is_a_hangup() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let outcome = CommandInvoker::default()
            .invoke(
                &CancellationToken::new(),
                Some(TruncatedReader::new(b"partial content".to_vec())),
                &shell("exec sleep 30", dir.path(), Duration::from_secs(20)),
            )
            .await?;

        assert_eq!(InvocationOutcome::ClientHangup, outcome);
        assert_eq!(StatusCode::GATEWAY_TIMEOUT, outcome.status());
        assert!(logs_contain("client hung up during signing operation"));
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_parent_kills_tool() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let parent = CancellationToken::new();
        let cancel = parent.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });

        let outcome = CommandInvoker::default()
            .invoke::<&[u8]>(
                &parent,
                None,
                &shell("exec sleep 30", dir.path(), Duration::from_secs(20)),
            )
            .await?;
        assert_eq!(InvocationOutcome::ClientHangup, outcome);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn tool_errors() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let invoker = CommandInvoker::default();
        let token = CancellationToken::new();

        let outcome = invoker
            .invoke::<&[u8]>(
                &token,
                None,
                &shell(
                    "echo 'no certificate of type X.509 found for key' >&2; exit 1",
                    dir.path(),
                    Duration::from_secs(10),
                ),
            )
            .await?;
        assert_eq!(
            InvocationOutcome::ToolError {
                status: StatusCode::BAD_REQUEST,
                message: "key does not support signatures of this type"
            },
            outcome
        );

        let outcome = invoker
            .invoke::<&[u8]>(
                &token,
                None,
                &shell("echo 'token is locked' >&2; exit 3", dir.path(), Duration::from_secs(10)),
            )
            .await?;
        assert_eq!(StatusCode::INTERNAL_SERVER_ERROR, outcome.status());
        assert!(logs_contain("token is locked"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_program() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let invocation = Invocation {
            command_line: vec!["/nonexistent/signing-tool".to_string()],
            work_dir: dir.path().to_path_buf(),
            combined_output: false,
            timeout: Duration::from_secs(1),
        };
        let token = CancellationToken::new();
        assert!(CommandInvoker::default()
            .invoke::<&[u8]>(&token, None, &invocation)
            .await
            .is_err());

        let empty = Invocation {
            command_line: vec![],
            ..invocation
        };
        assert!(CommandInvoker::default()
            .invoke::<&[u8]>(&token, None, &empty)
            .await
            .is_err());
        Ok(())
    }

    #[tokio::test]
    async fn admission_limits_concurrency() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let invoker = CommandInvoker::new(Some(1));
        let token = CancellationToken::new();
        let invocation = shell("sleep 0.3", dir.path(), Duration::from_secs(10));

        let started = Instant::now();
        let (first, second) = tokio::join!(
            invoker.invoke::<&[u8]>(&token, None, &invocation),
            invoker.invoke::<&[u8]>(&token, None, &invocation),
        );
        assert_eq!(StatusCode::OK, first?.status());
        assert_eq!(StatusCode::OK, second?.status());
        assert!(started.elapsed() >= Duration::from_millis(600));
        Ok(())
    }

    #[test]
    fn command_line_augmentation() {
        let peer = Peer {
            ip: "192.0.2.7".parse().unwrap(),
            name: "build-host".to_string(),
        };
        let request_query = vec![
            ("key".to_string(), "release".to_string()),
            ("digest".to_string(), "sha384".to_string()),
            ("filename".to_string(), "setup.ps1".to_string()),
        ];
        let command_line = augment_command_line(vec!["sigrelay".to_string()], &request_query, &peer);
        assert_eq!(
            vec![
                "sigrelay",
                "--digest",
                "sha384",
                "--attr",
                "client.filename=setup.ps1",
                "--attr",
                "client.ip=192.0.2.7",
                "--attr",
                "client.name=build-host",
            ],
            command_line
        );

        let command_line = augment_command_line(vec![], &[], &peer);
        assert_eq!(4, command_line.len());
    }

    #[test]
    fn command_line_formatting() {
        let command_line = ["sigrelay", "--attr", "client.filename=My Setup.ps1"].map(String::from);
        assert_eq!(
            "sigrelay --attr \"client.filename=My Setup.ps1\"",
            format_command_line(&command_line)
        );
    }
}
