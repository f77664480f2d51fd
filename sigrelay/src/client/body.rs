// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Request bodies that can be replayed against several servers.

use std::path::PathBuf;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

/// A source of request body content.
///
/// Every attempt against a server asks the source for a new reader, so a failed attempt that
/// consumed part of the body never leaves the next attempt with a short body.
pub trait BodySource: Send + Sync {
    /// Produce a fresh reader positioned at the start of the body.
    fn reader(&self) -> std::io::Result<Box<dyn AsyncRead + Send + Unpin + '_>>;
}

impl BodySource for Bytes {
    fn reader(&self) -> std::io::Result<Box<dyn AsyncRead + Send + Unpin + '_>> {
        Ok(Box::new(self.as_ref()))
    }
}

impl BodySource for Vec<u8> {
    fn reader(&self) -> std::io::Result<Box<dyn AsyncRead + Send + Unpin + '_>> {
        Ok(Box::new(self.as_slice()))
    }
}

/// A body read from a file on disk; the file is reopened for every attempt.
#[derive(Debug, Clone)]
pub struct FileBody(pub PathBuf);

impl BodySource for FileBody {
    fn reader(&self) -> std::io::Result<Box<dyn AsyncRead + Send + Unpin + '_>> {
        let file = std::fs::File::open(&self.0)?;
        Ok(Box::new(tokio::fs::File::from_std(file)))
    }
}

/// Read a complete body from a source behind a trait object.
pub(crate) async fn read_body(source: &dyn BodySource) -> std::io::Result<Bytes> {
    let mut body = vec![];
    source.reader()?.read_to_end(&mut body).await?;
    Ok(body.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_body_is_reread() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("input.bin");
        std::fs::write(&path, b"first")?;
        let body = FileBody(path.clone());
        assert_eq!(b"first".as_slice(), read_body(&body).await?.as_ref());

        std::fs::write(&path, b"second")?;
        assert_eq!(b"second".as_slice(), read_body(&body).await?.as_ref());
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let body = FileBody(PathBuf::from("/nonexistent/sigrelay/input"));
        assert!(read_body(&body).await.is_err());
    }
}
