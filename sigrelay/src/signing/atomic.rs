// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Output files that are either completely written or not written at all.

use std::{
    fmt::Display,
    io::{self, Write},
    path::{Path, PathBuf},
    str::FromStr,
};

use tempfile::NamedTempFile;

/// Where signed output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    File(PathBuf),
    Stdout,
}

impl FromStr for Destination {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "-" {
            Ok(Destination::Stdout)
        } else {
            Ok(Destination::File(PathBuf::from(s)))
        }
    }
}

impl Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Destination::File(path) => write!(f, "{}", path.display()),
            Destination::Stdout => f.write_str("-"),
        }
    }
}

enum Inner {
    File { file: NamedTempFile, path: PathBuf },
    Stdout(Vec<u8>),
}

/// A file written to a temporary location next to its destination and renamed into place on
/// [`AtomicFile::commit`].
///
/// Dropping the file without committing it removes the temporary file and leaves any existing
/// destination untouched. Output destined for stdout is buffered and written on commit.
pub struct AtomicFile {
    inner: Inner,
}

impl AtomicFile {
    pub fn create(destination: &Destination) -> io::Result<Self> {
        let inner = match destination {
            Destination::Stdout => Inner::Stdout(vec![]),
            Destination::File(path) => {
                let directory = match path.parent() {
                    Some(parent) if !parent.as_os_str().is_empty() => parent,
                    _ => Path::new("."),
                };
                let file = tempfile::Builder::new()
                    .prefix(".sigrelay-")
                    .tempfile_in(directory)?;
                Inner::File {
                    file,
                    path: path.clone(),
                }
            }
        };
        Ok(Self { inner })
    }

    /// Move the written content into place.
    ///
    /// If the destination already exists, its permissions are carried over to the new file.
    pub fn commit(self) -> io::Result<()> {
        match self.inner {
            Inner::Stdout(buffer) => {
                let mut stdout = io::stdout().lock();
                stdout.write_all(&buffer)?;
                stdout.flush()
            }
            Inner::File { mut file, path } => {
                file.flush()?;
                if let Ok(metadata) = std::fs::metadata(&path) {
                    file.as_file().set_permissions(metadata.permissions())?;
                }
                file.as_file().sync_all()?;
                file.persist(&path).map_err(|error| error.error)?;
                tracing::debug!(path = %path.display(), "Committed output file");
                Ok(())
            }
        }
    }
}

impl Write for AtomicFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.inner {
            Inner::File { file, .. } => file.write(buf),
            Inner::Stdout(buffer) => buffer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            Inner::File { file, .. } => file.flush(),
            Inner::Stdout(_) => Ok(()),
        }
    }
}

/// Write `content` to `destination` atomically.
pub fn write(destination: &Destination, content: &[u8]) -> io::Result<()> {
    let mut file = AtomicFile::create(destination)?;
    file.write_all(content)?;
    file.commit()
}
