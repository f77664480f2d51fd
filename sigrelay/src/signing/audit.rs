// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Audit records for signatures.

use std::{collections::BTreeMap, io::Write, path::PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Attribute names recorded for every signature.
pub mod attr {
    pub const KEY: &str = "sig.keyname";
    pub const SIG_TYPE: &str = "sig.type";
    pub const DIGEST: &str = "sig.digest";
    pub const MIME_TYPE: &str = "sig.mimetype";
    pub const FINGERPRINT: &str = "sig.certfingerprint";
    pub const FILENAME: &str = "sig.filename";
    pub const TIMESTAMP: &str = "sig.timestamp";
    pub const CLIENT_IP: &str = "client.ip";
    pub const CLIENT_NAME: &str = "client.name";
    pub const CLIENT_FILENAME: &str = "client.filename";
}

/// Audit settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Append each audit record to this file as a line of JSON.
    ///
    /// Records are always emitted as log events regardless of this setting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// The attributes of one signing operation.
///
/// A record is consumed by [`AuditRecord::commit`], so it can be committed only once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    attributes: BTreeMap<String, String>,
}

impl AuditRecord {
    pub fn new(key: &str, sig_type: &str) -> Self {
        let mut record = Self::default();
        record.set(attr::KEY, key);
        record.set(attr::SIG_TYPE, sig_type);
        record
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(name.into(), value.into());
    }

    pub fn extend(&mut self, attributes: impl IntoIterator<Item = (String, String)>) {
        self.attributes.extend(attributes);
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    /// Timestamp the record and write it to the audit sinks.
    pub fn commit(mut self, config: &AuditConfig) -> anyhow::Result<()> {
        self.set(attr::TIMESTAMP, chrono::Utc::now().to_rfc3339());
        tracing::info!(
            key = self.get(attr::KEY),
            sig_type = self.get(attr::SIG_TYPE),
            attributes = ?self.attributes,
            "Signature audit record"
        );

        if let Some(log_file) = &config.log_file {
            let mut line = serde_json::to_string(&self.attributes)?;
            line.push('\n');
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_file)
                .and_then(|mut file| file.write_all(line.as_bytes()))
                .with_context(|| format!("failed to append audit record to {log_file:?}"))?;
        }

        Ok(())
    }
}
