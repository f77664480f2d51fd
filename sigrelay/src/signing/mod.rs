// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! The signing pipeline.
//!
//! A [`Session`] signs one artifact at a time: it picks the format module, acquires the key,
//! produces the bytes to sign, signs them locally or on a signing server, writes the signed
//! artifact atomically, and finally commits an audit record.

use std::{
    collections::BTreeMap,
    io::{Cursor, Read, Seek, Write},
    path::PathBuf,
    sync::Arc,
};

use bytes::Bytes;
use tracing::instrument;

use crate::{
    client::{Config, RemoteClient},
    error::ClientError,
    protocol::{self, DigestAlgorithm, UnknownDigest},
};

pub mod atomic;
pub mod audit;
pub mod format;
pub mod raw;
pub mod script;
pub mod token;

use atomic::Destination;
use audit::{attr, AuditRecord};
use format::{FormatModule, InputStream, SignOptions};
use token::Key;

/// Errors that can occur while signing.
///
/// Errors before [`SignError::Commit`] leave the output untouched. [`SignError::Fixup`] and
/// [`SignError::Audit`] occur after the output was committed, and the output is kept.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SignError {
    /// No format module matches the requested signature type, or the input's file extension.
    #[error("unsupported signature type for '{0}'; use --sig-type to choose one")]
    UnsupportedFormat(String),

    /// The format module can't produce signatures.
    #[error("signature type '{0}' does not support signing")]
    CannotSign(&'static str),

    /// A flag was given that the format module doesn't declare.
    #[error("signature type '{sig_type}' has no flag named '{flag}'")]
    UnknownFlag { sig_type: &'static str, flag: String },

    #[error(transparent)]
    UnknownDigest(#[from] UnknownDigest),

    /// The key isn't in the configuration.
    #[error("key '{0}' not found in configuration")]
    KeyNotFound(String),

    /// The key is configured but can't be used.
    #[error("key '{name}' is unavailable: {source:#}")]
    TokenUnavailable {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    /// The format module doesn't accept input from standard input.
    #[error("signature type '{0}' cannot read from standard input")]
    StdinUnsupported(&'static str),

    /// The requested flags need the signed output rewritten in place, which standard output
    /// doesn't allow.
    #[error("signature type '{0}' with these flags must write its output to a file")]
    FixupNeedsFile(&'static str),

    /// Checking whether the input is already signed requires rewinding it.
    #[error("cannot check whether standard input is already signed")]
    CannotCheckStdin,

    /// The signing server couldn't sign the content.
    #[error("remote signing failed: {0}")]
    Remote(#[from] ClientError),

    /// The format module failed to process the input or make the signature.
    #[error("{0:#}")]
    Format(anyhow::Error),

    /// The signed output couldn't be written. Any existing output is untouched.
    #[error("failed to write signed output: {0:#}")]
    Commit(anyhow::Error),

    /// The post-signing fixup failed. The signed output has been written and is not rolled
    /// back.
    #[error("signed output was written, but fixing it up failed: {0:#}")]
    Fixup(anyhow::Error),

    /// The audit record couldn't be committed. The signed output has been written.
    #[error("signed output was written, but the audit record failed: {0:#}")]
    Audit(anyhow::Error),

    #[error("an I/O error occurred: {0}")]
    Io(#[from] std::io::Error),
}

/// Where the content to sign comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Path(PathBuf),
    Stdin,
}

impl std::str::FromStr for Source {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "-" {
            Ok(Source::Stdin)
        } else {
            Ok(Source::Path(PathBuf::from(s)))
        }
    }
}

/// Everything needed to sign one artifact.
#[derive(Debug, Clone)]
pub struct SignRequest {
    pub input: Source,
    /// Defaults to the format module's choice for file input, or stdout for stdin.
    pub output: Option<Destination>,
    pub key: String,
    pub digest: Option<String>,
    /// Overrides picking the format module from the input's file extension.
    pub sig_type: Option<String>,
    /// Leave already-signed input alone.
    pub if_unsigned: bool,
    pub flags: BTreeMap<String, String>,
    /// Extra attributes for the audit record.
    pub attributes: BTreeMap<String, String>,
}

impl SignRequest {
    pub fn new(input: Source, key: impl Into<String>) -> Self {
        Self {
            input,
            output: None,
            key: key.into(),
            digest: None,
            sig_type: None,
            if_unsigned: false,
            flags: BTreeMap::new(),
            attributes: BTreeMap::new(),
        }
    }
}

/// What a successful [`Session::sign`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignOutcome {
    Signed { output: Destination },
    /// `if_unsigned` was set and the input already had a signature; nothing was written.
    AlreadySigned,
}

/// A request from the server to sign a stream: the server-side half of remote signing.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub key: String,
    pub sig_type: String,
    pub digest: Option<String>,
    pub flags: BTreeMap<String, String>,
    pub attributes: BTreeMap<String, String>,
}

fn validate_flags(
    module: &dyn FormatModule,
    flags: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, SignError> {
    for flag in flags.keys() {
        if !module.flags().iter().any(|def| def.name == flag) {
            return Err(SignError::UnknownFlag {
                sig_type: module.name(),
                flag: flag.clone(),
            });
        }
    }
    Ok(flags.clone())
}

fn resolve_digest(digest: Option<&str>) -> Result<DigestAlgorithm, SignError> {
    Ok(digest
        .map(str::parse::<DigestAlgorithm>)
        .transpose()?
        .unwrap_or_default())
}

/// Signs artifacts with the keys in a client configuration.
#[derive(Debug, Clone)]
pub struct Session {
    config: Arc<Config>,
}

impl Session {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    fn client(&self) -> RemoteClient {
        RemoteClient::new(self.config.clone())
    }

    /// Sign an artifact.
    ///
    /// The output is committed atomically before the audit record, and the audit record is
    /// committed only if the output was.
    #[instrument(skip_all, err, fields(input = ?request.input, key = %request.key))]
    pub async fn sign(&self, request: SignRequest) -> Result<SignOutcome, SignError> {
        let module = match (&request.sig_type, &request.input) {
            (Some(sig_type), _) => format::by_name(sig_type)
                .ok_or_else(|| SignError::UnsupportedFormat(sig_type.clone()))?,
            (None, Source::Path(path)) => format::detect(path)
                .ok_or_else(|| SignError::UnsupportedFormat(path.display().to_string()))?,
            (None, Source::Stdin) => return Err(SignError::UnsupportedFormat("-".to_string())),
        };
        if !module.can_sign() {
            return Err(SignError::CannotSign(module.name()));
        }
        let flags = validate_flags(module, &request.flags)?;
        let digest = resolve_digest(request.digest.as_deref())?;
        let key = token::open_key(&self.config.keys, &request.key)?;

        let certificate = match &key {
            Key::Local(local) => local.certificate.clone(),
            Key::Remote { name } => Some(self.client().get_certificate(name).await?),
        };
        let options = SignOptions {
            digest,
            flags,
            path: match &request.input {
                Source::Path(path) => Some(path.clone()),
                Source::Stdin => None,
            },
        };

        let output = request.output.clone().unwrap_or_else(|| match &request.input {
            Source::Path(path) => Destination::File(module.default_output(path)),
            Source::Stdin => Destination::Stdout,
        });
        if matches!(output, Destination::Stdout) && module.needs_fixup(&options) {
            return Err(SignError::FixupNeedsFile(module.name()));
        }

        let mut input: Box<dyn InputStream> = match &request.input {
            Source::Path(path) => Box::new(std::fs::File::open(path)?),
            Source::Stdin => {
                if !module.allow_stdin() {
                    return Err(SignError::StdinUnsupported(module.name()));
                }
                if request.if_unsigned {
                    return Err(SignError::CannotCheckStdin);
                }
                let mut content = vec![];
                std::io::stdin().lock().read_to_end(&mut content)?;
                Box::new(Cursor::new(content))
            }
        };
        if request.if_unsigned {
            if module.is_signed(&mut *input).map_err(SignError::Format)? {
                tracing::info!(input = ?request.input, "Input is already signed; skipping");
                return Ok(SignOutcome::AlreadySigned);
            }
            input.rewind()?;
        }

        let transform = module
            .transform(&mut *input, &options)
            .map_err(SignError::Format)?;
        drop(input);
        let mut payload = vec![];
        transform
            .to_be_signed()
            .and_then(|mut reader| Ok(reader.read_to_end(&mut payload)?))
            .map_err(SignError::Format)?;

        let signed = match &key {
            Key::Local(local) => module
                .sign(&payload, local, &options)
                .map_err(SignError::Format)?,
            Key::Remote { name } => {
                let filename = options
                    .path
                    .as_ref()
                    .and_then(|path| path.file_name())
                    .map(|name| name.to_string_lossy().into_owned());
                self.client()
                    .sign(
                        name,
                        module.name(),
                        Some(digest),
                        filename.as_deref(),
                        &options.flags,
                        &Bytes::from(payload),
                    )
                    .await?
                    .to_vec()
            }
        };

        transform
            .apply(&output, module.mime_type(), &signed)
            .map_err(SignError::Commit)?;
        tracing::info!(%output, sig_type = module.name(), "Signed");

        if let Destination::File(path) = &output {
            if module.needs_fixup(&options) {
                std::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path)
                    .map_err(anyhow::Error::from)
                    .and_then(|mut file| module.fixup(&mut file, &options))
                    .map_err(SignError::Fixup)?;
            }
        }

        let mut record = AuditRecord::new(key.name(), module.name());
        record.set(attr::DIGEST, digest.as_str());
        record.set(attr::MIME_TYPE, module.mime_type());
        if let Some(path) = &options.path {
            record.set(attr::FILENAME, path.display().to_string());
        }
        if let Some(certificate) = &certificate {
            let fingerprint = protocol::fingerprint(certificate)
                .map_err(|error| SignError::Audit(error.into()))?;
            record.set(attr::FINGERPRINT, fingerprint);
        }
        record.extend(request.attributes);
        record
            .commit(&self.config.audit)
            .map_err(SignError::Audit)?;

        Ok(SignOutcome::Signed { output })
    }

    /// Sign the bytes read from `input` with a local key, writing what the format module
    /// produces to `output`.
    ///
    /// This is what signing servers run for each request: the input is the to-be-signed
    /// content from the client, and the output is returned to the client verbatim.
    #[instrument(skip_all, err, fields(key = %request.key, sig_type = %request.sig_type))]
    pub fn sign_stream(
        &self,
        request: StreamRequest,
        input: &mut dyn Read,
        output: &mut dyn Write,
    ) -> Result<(), SignError> {
        let module = format::by_name(&request.sig_type)
            .ok_or_else(|| SignError::UnsupportedFormat(request.sig_type.clone()))?;
        if !module.can_sign() {
            return Err(SignError::CannotSign(module.name()));
        }
        let flags = validate_flags(module, &request.flags)?;
        let digest = resolve_digest(request.digest.as_deref())?;
        let key = match token::open_key(&self.config.keys, &request.key)? {
            Key::Local(key) => key,
            Key::Remote { name } => {
                return Err(SignError::TokenUnavailable {
                    name,
                    source: anyhow::anyhow!("remote keys cannot sign streams"),
                })
            }
        };
        let options = SignOptions {
            digest,
            flags,
            path: None,
        };

        let mut payload = vec![];
        input.read_to_end(&mut payload)?;
        let signed = module
            .sign(&payload, &key, &options)
            .map_err(SignError::Format)?;
        output
            .write_all(&signed)
            .and_then(|_| output.flush())
            .map_err(|error| SignError::Commit(error.into()))?;

        let mut record = AuditRecord::new(&key.name, module.name());
        record.set(attr::DIGEST, digest.as_str());
        record.set(attr::MIME_TYPE, module.mime_type());
        if let Some(certificate) = &key.certificate {
            let fingerprint = protocol::fingerprint(certificate)
                .map_err(|error| SignError::Audit(error.into()))?;
            record.set(attr::FINGERPRINT, fingerprint);
        }
        record.extend(request.attributes);
        record
            .commit(&self.config.audit)
            .map_err(SignError::Audit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{signing::audit::AuditConfig, test_utils::SigningKey};

    const SCRIPT: &str = "Write-Output 'deploy'\n";

    struct Fixture {
        dir: tempfile::TempDir,
        _key: SigningKey,
        session: Session,
    }

    impl Fixture {
        fn new() -> anyhow::Result<Self> {
            let dir = tempfile::TempDir::new()?;
            let key = SigningKey::new("release")?;
            let config = Config {
                keys: BTreeMap::from([("release".to_string(), key.config())]),
                audit: AuditConfig {
                    log_file: Some(dir.path().join("audit.jsonl")),
                },
                ..Default::default()
            };
            Ok(Self {
                dir,
                _key: key,
                session: Session::new(Arc::new(config)),
            })
        }

        fn write(&self, name: &str, content: &str) -> anyhow::Result<PathBuf> {
            let path = self.dir.path().join(name);
            std::fs::write(&path, content)?;
            Ok(path)
        }

        fn audit_lines(&self) -> usize {
            std::fs::read_to_string(self.dir.path().join("audit.jsonl"))
                .map(|log| log.lines().count())
                .unwrap_or_default()
        }
    }

    #[tokio::test]
    async fn sign_script_in_place() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let path = fixture.write("deploy.ps1", SCRIPT)?;

        let outcome = fixture
            .session
            .sign(SignRequest::new(Source::Path(path.clone()), "release"))
            .await?;

        assert_eq!(
            SignOutcome::Signed {
                output: Destination::File(path.clone())
            },
            outcome
        );
        let verified = script::Script.verify(&std::fs::read(&path)?, None)?;
        assert_eq!(DigestAlgorithm::Sha256, verified.digest);
        assert_eq!(1, fixture.audit_lines());
        Ok(())
    }

    #[tokio::test]
    async fn if_unsigned_leaves_signed_input_alone() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let path = fixture.write("deploy.ps1", SCRIPT)?;
        fixture
            .session
            .sign(SignRequest::new(Source::Path(path.clone()), "release"))
            .await?;
        let signed = std::fs::read(&path)?;
        let modified = std::fs::metadata(&path)?.modified()?;

        let mut request = SignRequest::new(Source::Path(path.clone()), "release");
        request.if_unsigned = true;
        request.digest = Some("sha512".to_string());
        let outcome = fixture.session.sign(request).await?;

        assert_eq!(SignOutcome::AlreadySigned, outcome);
        assert_eq!(signed, std::fs::read(&path)?);
        assert_eq!(modified, std::fs::metadata(&path)?.modified()?);
        assert_eq!(1, fixture.audit_lines());
        Ok(())
    }

    #[tokio::test]
    async fn resigning_replaces_signature() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let path = fixture.write("deploy.ps1", SCRIPT)?;
        for digest in ["sha256", "sha3-512"] {
            let mut request = SignRequest::new(Source::Path(path.clone()), "release");
            request.digest = Some(digest.to_string());
            fixture.session.sign(request).await?;
        }

        let signed = std::fs::read_to_string(&path)?;
        assert_eq!(1, signed.matches("# SIG # Begin signature block").count());
        let verified = script::Script.verify(signed.as_bytes(), None)?;
        assert_eq!(DigestAlgorithm::Sha3_512, verified.digest);
        Ok(())
    }

    #[tokio::test]
    async fn raw_signature_beside_input() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let path = fixture.write("firmware.bin", "\u{1}\u{2}\u{3}")?;
        let mut request = SignRequest::new(Source::Path(path.clone()), "release");
        request.sig_type = Some("raw".to_string());
        request.flags = BTreeMap::from([("armor".to_string(), "true".to_string())]);

        fixture.session.sign(request).await?;

        let signature = std::fs::read(fixture.dir.path().join("firmware.bin.sig"))?;
        raw::Raw.verify(&std::fs::read(&path)?, Some(&signature))?;
        Ok(())
    }

    #[tokio::test]
    async fn fixup_runs_on_committed_output() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let path = fixture.write("deploy.ps1", SCRIPT)?;
        let output = fixture.dir.path().join("signed.ps1");
        let mut request = SignRequest::new(Source::Path(path.clone()), "release");
        request.output = Some(Destination::File(output.clone()));
        request.flags = BTreeMap::from([("crlf".to_string(), "true".to_string())]);

        fixture.session.sign(request).await?;

        let signed = std::fs::read_to_string(&output)?;
        assert!(signed.contains("\r\n# SIG # End signature block\r\n"));
        script::Script.verify(signed.as_bytes(), None)?;
        assert_eq!(SCRIPT, std::fs::read_to_string(&path)?);
        Ok(())
    }

    #[tokio::test]
    async fn fixup_to_stdout_is_refused() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let path = fixture.write("deploy.ps1", SCRIPT)?;
        let mut request = SignRequest::new(Source::Path(path.clone()), "release");
        request.output = Some(Destination::Stdout);
        request.flags = BTreeMap::from([("crlf".to_string(), "true".to_string())]);

        let error = fixture.session.sign(request).await.unwrap_err();

        assert!(matches!(error, SignError::FixupNeedsFile("script")), "{error:?}");
        assert_eq!(SCRIPT, std::fs::read_to_string(&path)?);
        assert_eq!(0, fixture.audit_lines());
        Ok(())
    }

    #[tokio::test]
    async fn request_errors() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let script = fixture.write("deploy.ps1", SCRIPT)?;
        let unknown = fixture.write("archive.zip", "PK")?;

        let error = fixture
            .session
            .sign(SignRequest::new(Source::Path(unknown), "release"))
            .await
            .unwrap_err();
        assert!(matches!(error, SignError::UnsupportedFormat(_)));

        let mut request = SignRequest::new(Source::Path(script.clone()), "release");
        request.flags = BTreeMap::from([("armor".to_string(), "true".to_string())]);
        let error = fixture.session.sign(request).await.unwrap_err();
        assert!(matches!(error, SignError::UnknownFlag { .. }));

        let mut request = SignRequest::new(Source::Path(script.clone()), "release");
        request.digest = Some("md5".to_string());
        let error = fixture.session.sign(request).await.unwrap_err();
        assert!(matches!(error, SignError::UnknownDigest(_)));

        let error = fixture
            .session
            .sign(SignRequest::new(Source::Path(script.clone()), "nope"))
            .await
            .unwrap_err();
        assert!(matches!(error, SignError::KeyNotFound(_)));

        let mut request = SignRequest::new(Source::Stdin, "release");
        request.sig_type = Some("script".to_string());
        let error = fixture.session.sign(request).await.unwrap_err();
        assert!(matches!(error, SignError::StdinUnsupported("script")));

        let mut request = SignRequest::new(Source::Stdin, "release");
        request.sig_type = Some("raw".to_string());
        request.if_unsigned = true;
        let error = fixture.session.sign(request).await.unwrap_err();
        assert!(matches!(error, SignError::CannotCheckStdin));

        assert_eq!(SCRIPT, std::fs::read_to_string(&script)?);
        assert_eq!(0, fixture.audit_lines());
        Ok(())
    }

    #[tokio::test]
    async fn audit_failure_keeps_output() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let key = SigningKey::new("release")?;
        let session = Session::new(Arc::new(Config {
            keys: BTreeMap::from([("release".to_string(), key.config())]),
            audit: AuditConfig {
                log_file: Some(PathBuf::from("/nonexistent/sigrelay/audit.jsonl")),
            },
            ..Default::default()
        }));
        let path = fixture.write("deploy.ps1", SCRIPT)?;

        let error = session
            .sign(SignRequest::new(Source::Path(path.clone()), "release"))
            .await
            .unwrap_err();

        assert!(matches!(error, SignError::Audit(_)));
        script::Script.verify(&std::fs::read(&path)?, None)?;
        Ok(())
    }

    #[test]
    fn stream_signing() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let request = StreamRequest {
            key: "release".to_string(),
            sig_type: "raw".to_string(),
            digest: Some("sha384".to_string()),
            flags: BTreeMap::new(),
            attributes: BTreeMap::from([(
                attr::CLIENT_NAME.to_string(),
                "builder.example.com".to_string(),
            )]),
        };
        let mut output = vec![];

        fixture
            .session
            .sign_stream(request, &mut b"payload".as_slice(), &mut output)?;

        let verified = raw::Raw.verify(b"payload", Some(&output))?;
        assert_eq!(DigestAlgorithm::Sha384, verified.digest);
        let log = std::fs::read_to_string(fixture.dir.path().join("audit.jsonl"))?;
        assert!(log.contains("builder.example.com"));
        Ok(())
    }

    #[test]
    fn stream_signing_without_certificate() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let key = SigningKey::new("bare")?;
        let session = Session::new(Arc::new(Config {
            keys: BTreeMap::from([("bare".to_string(), key.config_without_certificate())]),
            audit: fixture.session.config.audit.clone(),
            ..Default::default()
        }));
        let request = StreamRequest {
            key: "bare".to_string(),
            sig_type: "raw".to_string(),
            digest: None,
            flags: BTreeMap::new(),
            attributes: BTreeMap::new(),
        };

        let error = session
            .sign_stream(request, &mut b"payload".as_slice(), &mut vec![])
            .unwrap_err();

        assert!(error.to_string().contains("no certificate of type"));
        Ok(())
    }
}
