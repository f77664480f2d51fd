// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

#![cfg(feature = "cli")]

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};

use http::StatusCode;
use sigrelay::{
    client::{Config, RemoteClient, RemoteConfig},
    error::{ClientError, ServerError},
    signing::{
        format::FormatModule, raw::Raw, script::Script, Session, SignError, SignOutcome,
        SignRequest, Source,
    },
};
use sigrelay_test::{create_instance, Instance, CLIENT_NAME};

const SCRIPT: &str = "Write-Output 'deploy'\r\nExit 0\r\n";

fn sigrelay_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_sigrelay"))
}

async fn instance() -> anyhow::Result<Instance> {
    create_instance(&sigrelay_binary(), |_| {}).await
}

fn write_script(dir: &Path) -> anyhow::Result<PathBuf> {
    let path = dir.join("deploy.ps1");
    std::fs::write(&path, SCRIPT)?;
    Ok(path)
}

fn server_error(error: SignError) -> ServerError {
    match error {
        SignError::Remote(ClientError::Server(error)) => error,
        other => panic!("expected a server error, got {other:?}"),
    }
}

#[tokio::test]
async fn remote_script_signing() -> anyhow::Result<()> {
    let instance = instance().await?;
    let path = write_script(instance.state_dir.path())?;

    let outcome = Session::new(Arc::new(instance.client.clone()))
        .sign(SignRequest::new(Source::Path(path.clone()), "release"))
        .await?;

    assert_eq!(
        SignOutcome::Signed {
            output: sigrelay::signing::atomic::Destination::File(path.clone())
        },
        outcome
    );
    let signed = std::fs::read(&path)?;
    let verified = Script.verify(&signed, None)?;
    assert_eq!(
        Some("release".to_string()),
        sigrelay::protocol::common_name(&verified.certificate)
    );

    let signer_audit = std::fs::read_to_string(instance.signer_audit_log())?;
    assert!(signer_audit.contains(&format!("\"client.name\":\"{CLIENT_NAME}\"")));
    assert!(signer_audit.contains("\"client.filename\":\"deploy.ps1\""));
    assert!(signer_audit.contains("\"client.ip\":\"127.0.0.1\""));
    let client_audit = std::fs::read_to_string(instance.client_audit_log())?;
    assert_eq!(1, client_audit.lines().count());

    instance.server.halt().await?;
    Ok(())
}

#[tokio::test]
async fn remote_raw_signing_with_flags() -> anyhow::Result<()> {
    let instance = instance().await?;
    let path = instance.state_dir.path().join("artifact.tar");
    std::fs::write(&path, b"artifact contents")?;

    let mut request = SignRequest::new(Source::Path(path.clone()), "release");
    request.sig_type = Some("raw".to_string());
    request.digest = Some("sha512".to_string());
    request
        .flags
        .insert("armor".to_string(), "true".to_string());
    Session::new(Arc::new(instance.client.clone()))
        .sign(request)
        .await?;

    let signature = std::fs::read(instance.state_dir.path().join("artifact.tar.sig"))?;
    assert!(String::from_utf8_lossy(&signature).starts_with("-----BEGIN SIGRELAY SIGNATURE-----"));
    let verified = Raw.verify(b"artifact contents", Some(&signature))?;
    assert_eq!("sha512", verified.digest.as_str());

    instance.server.halt().await?;
    Ok(())
}

#[tokio::test]
async fn key_listing() -> anyhow::Result<()> {
    let instance = instance().await?;
    let client = RemoteClient::new(Arc::new(instance.client.clone()));

    assert_eq!(vec!["bare", "release"], client.list_keys().await?);
    let certificate = client.get_certificate("release").await?;
    assert_eq!(
        Some("release".to_string()),
        sigrelay::protocol::common_name(&certificate)
    );

    match client.get_certificate("missing").await.unwrap_err() {
        ClientError::Server(error) => assert_eq!(StatusCode::NOT_FOUND, error.status),
        other => panic!("unexpected error {other:?}"),
    }

    instance.server.halt().await?;
    Ok(())
}

#[tokio::test]
async fn key_without_certificate_is_a_client_error() -> anyhow::Result<()> {
    let instance = instance().await?;
    let path = write_script(instance.state_dir.path())?;

    let error = Session::new(Arc::new(instance.client.clone()))
        .sign(SignRequest::new(Source::Path(path.clone()), "bare"))
        .await
        .unwrap_err();

    let error = server_error(error);
    assert_eq!(StatusCode::BAD_REQUEST, error.status);
    assert_eq!("key does not support signatures of this type", error.message);
    assert_eq!(SCRIPT, std::fs::read_to_string(&path)?);

    instance.server.halt().await?;
    Ok(())
}

#[tokio::test]
async fn unknown_signature_type_is_reported() -> anyhow::Result<()> {
    let instance = instance().await?;
    let client = RemoteClient::new(Arc::new(instance.client.clone()));

    let error = client
        .sign(
            "release",
            "jar",
            None,
            None,
            &Default::default(),
            &bytes::Bytes::from_static(b"content"),
        )
        .await
        .unwrap_err();
    match error {
        ClientError::Server(error) => {
            assert_eq!(StatusCode::INTERNAL_SERVER_ERROR, error.status);
            assert!(!error.message.contains("jar"));
        }
        other => panic!("unexpected error {other:?}"),
    }

    instance.server.halt().await?;
    Ok(())
}

#[tokio::test]
async fn directory_failover_and_compression() -> anyhow::Result<()> {
    let signer = instance().await?;
    let signer_url = signer.url();
    let signer_credentials = signer.pki.server_credentials();
    let directory = create_instance(&sigrelay_binary(), |config| {
        config.credentials = signer_credentials;
        config.directory = vec!["https://localhost:1/".to_string(), signer_url];
    })
    .await?;

    let client_config = Config {
        remote: Some(RemoteConfig {
            url: None,
            directory_url: Some(directory.url()),
            ..signer.pki.remote_config("")
        }),
        ..signer.client.clone()
    };
    let path = write_script(signer.state_dir.path())?;
    Session::new(Arc::new(client_config))
        .sign(SignRequest::new(Source::Path(path.clone()), "release"))
        .await?;

    Script.verify(&std::fs::read(&path)?, None)?;
    // The directory server never ran the signing tool.
    assert!(!directory.signer_audit_log().exists());
    assert!(signer.signer_audit_log().exists());

    directory.server.halt().await?;
    signer.server.halt().await?;
    Ok(())
}

#[tokio::test]
async fn signing_tool_timeout() -> anyhow::Result<()> {
    let instance = create_instance(&sigrelay_binary(), |config| {
        config.signing_command = vec!["sh".to_string(), "-c".to_string(), "exec sleep 30".to_string()];
        config.signing_timeout = 1;
    })
    .await?;
    let path = write_script(instance.state_dir.path())?;

    let started = Instant::now();
    let error = Session::new(Arc::new(instance.client.clone()))
        .sign(SignRequest::new(Source::Path(path.clone()), "release"))
        .await
        .unwrap_err();

    let error = server_error(error);
    assert_eq!(StatusCode::GATEWAY_TIMEOUT, error.status);
    assert_eq!("Signing command timed out", error.message);
    assert!(started.elapsed() < Duration::from_secs(20));
    assert_eq!(SCRIPT, std::fs::read_to_string(&path)?);

    instance.server.halt().await?;
    Ok(())
}

#[tokio::test]
async fn abort_cancels_running_tools() -> anyhow::Result<()> {
    let instance = create_instance(&sigrelay_binary(), |config| {
        config.signing_command = vec!["sh".to_string(), "-c".to_string(), "exec sleep 30".to_string()];
        config.signing_timeout = 60;
    })
    .await?;
    let path = write_script(instance.state_dir.path())?;
    let session = Session::new(Arc::new(instance.client.clone()));
    let request = tokio::spawn(async move {
        session
            .sign(SignRequest::new(Source::Path(path), "release"))
            .await
    });
    tokio::time::sleep(Duration::from_millis(500)).await;

    let started = Instant::now();
    instance.server.abort().await?;
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(request.await?.is_err());
    Ok(())
}

#[tokio::test]
async fn untrusted_client_is_rejected() -> anyhow::Result<()> {
    let instance = instance().await?;
    let other_pki = sigrelay_test::TestPki::new()?;
    let client_config = Config {
        remote: Some(RemoteConfig {
            cacert: Some(instance.pki.ca_certificate_path().display().to_string()),
            ..other_pki.remote_config(&instance.url())
        }),
        ..instance.client.clone()
    };

    let error = RemoteClient::new(Arc::new(client_config))
        .list_keys()
        .await
        .unwrap_err();
    assert!(matches!(error, ClientError::Connection(_)), "{error:?}");

    instance.server.halt().await?;
    Ok(())
}
