// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Utilities for testing sigrelay components, useful across unit tests and end-to-end tests.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
};

use openssl::{
    asn1::Asn1Time,
    bn::{BigNum, MsbOption},
    ec::{EcGroup, EcKey},
    hash::MessageDigest,
    nid::Nid,
    pkey::{Id, PKey, PKeyRef, Private},
    x509::{
        extension::{
            BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
        },
        X509Builder, X509NameBuilder, X509Ref, X509,
    },
};
use sigrelay::{client, config::Credentials, server, signing::audit::AuditConfig};

/// The common name of the client certificate issued by [`TestPki`].
pub const CLIENT_NAME: &str = "sigrelay-client";
/// The common name, and DNS name, of the server certificate issued by [`TestPki`].
pub const SERVER_NAME: &str = "localhost";

#[derive(Debug, Clone, Copy)]
enum Usage {
    Authority,
    Server,
    Client,
    CodeSigning,
}

/// The algorithm of a generated signing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    EcP256,
    Ed25519,
}

fn generate_key(kind: KeyKind) -> anyhow::Result<PKey<Private>> {
    Ok(match kind {
        KeyKind::EcP256 => {
            let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
            PKey::from_ec_key(EcKey::generate(&group)?)?
        }
        KeyKind::Ed25519 => PKey::generate_ed25519()?,
    })
}

fn issue(
    common_name: &str,
    key: &PKeyRef<Private>,
    issuer: Option<(&X509Ref, &PKeyRef<Private>)>,
    usage: Usage,
) -> anyhow::Result<X509> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    let name = name.build();

    let mut serial = BigNum::new()?;
    serial.rand(127, MsbOption::MAYBE_ZERO, false)?;

    let mut builder = X509Builder::new()?;
    builder.set_version(2)?;
    builder.set_serial_number(&*serial.to_asn1_integer()?)?;
    builder.set_subject_name(&name)?;
    match issuer {
        Some((issuer_certificate, _)) => {
            builder.set_issuer_name(issuer_certificate.subject_name())?
        }
        None => builder.set_issuer_name(&name)?,
    }
    builder.set_pubkey(key)?;
    builder.set_not_before(&*Asn1Time::days_from_now(0)?)?;
    builder.set_not_after(&*Asn1Time::days_from_now(30)?)?;

    match usage {
        Usage::Authority => {
            builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
            builder.append_extension(
                KeyUsage::new()
                    .critical()
                    .key_cert_sign()
                    .crl_sign()
                    .build()?,
            )?;
        }
        Usage::Server => {
            builder.append_extension(BasicConstraints::new().build()?)?;
            builder.append_extension(KeyUsage::new().digital_signature().build()?)?;
            builder.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;
            let alt_names = SubjectAlternativeName::new()
                .dns(SERVER_NAME)
                .ip("127.0.0.1")
                .build(&builder.x509v3_context(issuer.map(|(certificate, _)| certificate), None))?;
            builder.append_extension(alt_names)?;
        }
        Usage::Client => {
            builder.append_extension(BasicConstraints::new().build()?)?;
            builder.append_extension(KeyUsage::new().digital_signature().build()?)?;
            builder.append_extension(ExtendedKeyUsage::new().client_auth().build()?)?;
        }
        Usage::CodeSigning => {
            builder.append_extension(BasicConstraints::new().build()?)?;
            builder.append_extension(KeyUsage::new().digital_signature().build()?)?;
            builder.append_extension(ExtendedKeyUsage::new().code_signing().build()?)?;
        }
    }

    let signing_key = issuer.map(|(_, key)| key).unwrap_or(key);
    let digest = if signing_key.id() == Id::ED25519 {
        MessageDigest::null()
    } else {
        MessageDigest::sha256()
    };
    builder.sign(signing_key, digest)?;
    Ok(builder.build())
}

fn write_pair(
    dir: &Path,
    stem: &str,
    key: &PKeyRef<Private>,
    certificate: &X509Ref,
) -> anyhow::Result<()> {
    std::fs::write(
        dir.join(format!("{stem}.key.pem")),
        key.private_key_to_pem_pkcs8()?,
    )?;
    std::fs::write(dir.join(format!("{stem}.certificate.pem")), certificate.to_pem()?)?;
    Ok(())
}

/// A throwaway certificate authority with a server and a client certificate, written as PEM
/// files to a temporary directory.
pub struct TestPki {
    dir: tempfile::TempDir,
}

impl TestPki {
    pub fn new() -> anyhow::Result<Self> {
        let dir = tempfile::TempDir::new()?;

        let ca_key = generate_key(KeyKind::EcP256)?;
        let ca = issue("sigrelay test CA", &ca_key, None, Usage::Authority)?;
        write_pair(dir.path(), "ca", &ca_key, &ca)?;

        let server_key = generate_key(KeyKind::EcP256)?;
        let server = issue(SERVER_NAME, &server_key, Some((&ca, &ca_key)), Usage::Server)?;
        write_pair(dir.path(), "server", &server_key, &server)?;

        let client_key = generate_key(KeyKind::EcP256)?;
        let client = issue(CLIENT_NAME, &client_key, Some((&ca, &ca_key)), Usage::Client)?;
        write_pair(dir.path(), "client", &client_key, &client)?;

        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn ca_certificate_path(&self) -> PathBuf {
        self.dir.path().join("ca.certificate.pem")
    }

    pub fn server_certificate_path(&self) -> PathBuf {
        self.dir.path().join("server.certificate.pem")
    }

    pub fn server_key_path(&self) -> PathBuf {
        self.dir.path().join("server.key.pem")
    }

    pub fn client_certificate_path(&self) -> PathBuf {
        self.dir.path().join("client.certificate.pem")
    }

    pub fn client_key_path(&self) -> PathBuf {
        self.dir.path().join("client.key.pem")
    }

    /// The credentials a server should use.
    pub fn server_credentials(&self) -> Credentials {
        Credentials {
            private_key: self.server_key_path(),
            certificate: self.server_certificate_path(),
            ca_certificate: self.ca_certificate_path(),
        }
    }

    /// Remote settings for a client connecting to `url` with this PKI's client certificate.
    pub fn remote_config(&self, url: &str) -> client::RemoteConfig {
        client::RemoteConfig {
            url: Some(url.to_string()),
            certfile: Some(self.client_certificate_path().display().to_string()),
            keyfile: Some(self.client_key_path().display().to_string()),
            cacert: Some(self.ca_certificate_path().display().to_string()),
            connect_timeout: 5,
            ..Default::default()
        }
    }
}

/// Generate a signing key with a self-signed code-signing certificate.
///
/// The key is written to `<name>.key.pem` and the certificate to `<name>.certificate.pem` in
/// `dir`; their paths are returned in that order.
pub fn create_signing_key(
    dir: &Path,
    name: &str,
    kind: KeyKind,
) -> anyhow::Result<(PathBuf, PathBuf)> {
    let key = generate_key(kind)?;
    let certificate = issue(name, &key, None, Usage::CodeSigning)?;
    write_pair(dir, name, &key, &certificate)?;
    Ok((
        dir.join(format!("{name}.key.pem")),
        dir.join(format!("{name}.certificate.pem")),
    ))
}

/// A running server together with the configuration for a client of it.
pub struct Instance {
    pub server: server::service::Listener,
    /// A client configured to send signing requests for `release` and `bare` to the server.
    pub client: client::Config,
    /// The configuration the server's signing tool runs with.
    pub signer_config: PathBuf,
    pub pki: TestPki,
    // Dropping TempDir cleans up the directory, but it needs to live to the end of the test.
    pub state_dir: tempfile::TempDir,
}

impl Instance {
    /// The base URL of the server.
    pub fn url(&self) -> String {
        format!("https://{SERVER_NAME}:{}/", self.server.local_addr().port())
    }

    /// Where the signing tool records audit entries.
    pub fn signer_audit_log(&self) -> PathBuf {
        self.state_dir.path().join("signer-audit.jsonl")
    }

    /// Where the client records audit entries.
    pub fn client_audit_log(&self) -> PathBuf {
        self.state_dir.path().join("client-audit.jsonl")
    }
}

/// Start a server whose signing tool is `sigrelay_binary`.
///
/// The signing tool has two keys: `release`, which has a certificate, and `bare`, which
/// doesn't. The server's configuration can be adjusted with `customize` before it starts.
pub async fn create_instance(
    sigrelay_binary: &Path,
    customize: impl FnOnce(&mut server::Config),
) -> anyhow::Result<Instance> {
    let pki = TestPki::new()?;
    let state_dir = tempfile::TempDir::new()?;

    let (release_key, release_certificate) =
        create_signing_key(state_dir.path(), "release", KeyKind::EcP256)?;
    let (bare_key, _) = create_signing_key(state_dir.path(), "bare", KeyKind::EcP256)?;
    let signer = client::Config {
        keys: BTreeMap::from([
            (
                "release".to_string(),
                sigrelay::signing::token::KeyConfig::File {
                    private_key: release_key,
                    certificate: Some(release_certificate.clone()),
                },
            ),
            (
                "bare".to_string(),
                sigrelay::signing::token::KeyConfig::File {
                    private_key: bare_key,
                    certificate: None,
                },
            ),
        ]),
        audit: AuditConfig {
            log_file: Some(state_dir.path().join("signer-audit.jsonl")),
        },
        ..Default::default()
    };
    let signer_config = state_dir.path().join("signer.toml");
    std::fs::write(&signer_config, signer.to_string())?;

    let mut server_config = server::Config {
        listen_address: SocketAddr::from_str("127.0.0.1:0")?,
        credentials: pki.server_credentials(),
        signing_command: vec![
            sigrelay_binary.display().to_string(),
            "--config".to_string(),
            signer_config.display().to_string(),
        ],
        signing_timeout: 30,
        work_directory: state_dir.path().join("work"),
        keys: BTreeMap::from([
            (
                "release".to_string(),
                server::ServerKey {
                    certificate: release_certificate.clone(),
                },
            ),
            (
                "bare".to_string(),
                server::ServerKey {
                    certificate: release_certificate,
                },
            ),
        ]),
        ..Default::default()
    };
    customize(&mut server_config);
    let server = server::service::Server::new(server_config)?.run()?;
    tracing::info!(address = %server.local_addr(), "Test server started");

    let client = client::Config {
        remote: Some(pki.remote_config(&format!(
            "https://{SERVER_NAME}:{}/",
            server.local_addr().port()
        ))),
        keys: BTreeMap::from([
            ("release".to_string(), sigrelay::signing::token::KeyConfig::Remote),
            ("bare".to_string(), sigrelay::signing::token::KeyConfig::Remote),
        ]),
        audit: AuditConfig {
            log_file: Some(state_dir.path().join("client-audit.jsonl")),
        },
    };

    Ok(Instance {
        server,
        client,
        signer_config,
        pki,
        state_dir,
    })
}
