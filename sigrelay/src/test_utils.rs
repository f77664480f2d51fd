// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::{
    io,
    path::PathBuf,
    pin::Pin,
    task::{Context, Poll},
};

pub(crate) use sigrelay_test::TestPki;
use sigrelay_test::KeyKind;
use tokio::io::{AsyncRead, ReadBuf};

use crate::signing::token::{KeyConfig, LocalKey};

/// A signing key and self-signed certificate in a temporary directory.
pub(crate) struct SigningKey {
    name: String,
    private_key: PathBuf,
    certificate: PathBuf,
    _dir: tempfile::TempDir,
}

impl SigningKey {
    pub(crate) fn new(name: &str) -> anyhow::Result<Self> {
        Self::generate(name, KeyKind::EcP256)
    }

    pub(crate) fn ed25519(name: &str) -> anyhow::Result<Self> {
        Self::generate(name, KeyKind::Ed25519)
    }

    fn generate(name: &str, kind: KeyKind) -> anyhow::Result<Self> {
        let dir = tempfile::TempDir::new()?;
        let (private_key, certificate) = sigrelay_test::create_signing_key(dir.path(), name, kind)?;
        Ok(Self {
            name: name.to_string(),
            private_key,
            certificate,
            _dir: dir,
        })
    }

    pub(crate) fn private_key_path(&self) -> PathBuf {
        self.private_key.clone()
    }

    pub(crate) fn certificate_path(&self) -> PathBuf {
        self.certificate.clone()
    }

    pub(crate) fn config(&self) -> KeyConfig {
        KeyConfig::File {
            private_key: self.private_key_path(),
            certificate: Some(self.certificate_path()),
        }
    }

    pub(crate) fn config_without_certificate(&self) -> KeyConfig {
        KeyConfig::File {
            private_key: self.private_key_path(),
            certificate: None,
        }
    }

    pub(crate) fn load(&self) -> anyhow::Result<LocalKey> {
        LocalKey::load(&self.name, &self.private_key, Some(&self.certificate))
    }
}

/// Yields its content, then fails the way a request body does when the client hangs up.
pub(crate) struct TruncatedReader {
    content: Vec<u8>,
    position: usize,
}

impl TruncatedReader {
    pub(crate) fn new(content: Vec<u8>) -> Self {
        Self {
            content,
            position: 0,
        }
    }
}

impl AsyncRead for TruncatedReader {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let remaining = &this.content[this.position..];
        if remaining.is_empty() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client disconnected",
            )));
        }
        let count = remaining.len().min(buf.remaining());
        buf.put_slice(&remaining[..count]);
        this.position += count;
        Poll::Ready(Ok(()))
    }
}
