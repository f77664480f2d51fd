// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Signature blocks appended to PowerShell-style scripts.
//!
//! The signature covers the script text preceding the block, with line endings normalized to
//! `\n`, so converting line endings after signing doesn't invalidate it. Signing a script
//! that already has a block replaces the old block.

use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::{anyhow, Context};

use super::{
    atomic::{self, Destination},
    format::{
        FlagDef, FormatModule, InputStream, SignOptions, SignatureBlock, Transform, Verified,
    },
    token::LocalKey,
};

const BLOCK_BEGIN: &str = "# SIG # Begin signature block";
const BLOCK_END: &str = "# SIG # End signature block";
const LINE_PREFIX: &str = "# SIG # ";

/// Signs scripts by appending a comment block.
pub struct Script;

/// Split a script into its text and the signature block, if it has one.
fn split_block(text: &str) -> (&str, Option<&str>) {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.trim_end() == BLOCK_BEGIN {
            return (&text[..offset], Some(&text[offset..]));
        }
        offset += line.len();
    }
    (text, None)
}

fn normalize(text: &str) -> Vec<u8> {
    text.replace("\r\n", "\n").into_bytes()
}

fn read_text(input: &mut dyn InputStream) -> anyhow::Result<String> {
    let mut text = String::new();
    input
        .read_to_string(&mut text)
        .context("scripts must be UTF-8 text")?;
    Ok(text)
}

struct ScriptTransform {
    body: String,
}

impl Transform for ScriptTransform {
    fn to_be_signed(&self) -> anyhow::Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(std::io::Cursor::new(normalize(&self.body))))
    }

    fn apply(
        &self,
        destination: &Destination,
        _mime_type: &str,
        signed: &[u8],
    ) -> anyhow::Result<()> {
        let mut output = atomic::AtomicFile::create(destination)?;
        output.write_all(self.body.as_bytes())?;
        output.write_all(signed)?;
        output.commit()?;
        Ok(())
    }
}

impl FormatModule for Script {
    fn name(&self) -> &'static str {
        "script"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["ps1", "psm1", "psd1"]
    }

    fn flags(&self) -> &'static [FlagDef] {
        &[FlagDef {
            name: "crlf",
            description: "Convert the signed script to CRLF line endings",
        }]
    }

    fn mime_type(&self) -> &'static str {
        "text/plain"
    }

    fn is_signed(&self, input: &mut dyn InputStream) -> anyhow::Result<bool> {
        let text = read_text(input)?;
        Ok(split_block(&text).1.is_some())
    }

    fn transform(
        &self,
        input: &mut dyn InputStream,
        _options: &SignOptions,
    ) -> anyhow::Result<Box<dyn Transform>> {
        let text = read_text(input)?;
        let mut body = split_block(&text).0.to_string();
        if !body.is_empty() && !body.ends_with('\n') {
            body.push('\n');
        }
        Ok(Box::new(ScriptTransform { body }))
    }

    fn sign(
        &self,
        payload: &[u8],
        key: &LocalKey,
        options: &SignOptions,
    ) -> anyhow::Result<Vec<u8>> {
        let block = SignatureBlock::create(payload, key, options.digest)?.render(LINE_PREFIX)?;
        Ok(format!("{BLOCK_BEGIN}\n{block}{BLOCK_END}\n").into_bytes())
    }

    fn needs_fixup(&self, options: &SignOptions) -> bool {
        options.flag_enabled("crlf")
    }

    fn fixup(&self, output: &mut std::fs::File, _options: &SignOptions) -> anyhow::Result<()> {
        let mut text = String::new();
        output.read_to_string(&mut text)?;
        let converted = text.replace("\r\n", "\n").replace('\n', "\r\n");
        output.seek(SeekFrom::Start(0))?;
        output.set_len(0)?;
        output.write_all(converted.as_bytes())?;
        output.sync_all()?;
        Ok(())
    }

    fn verify(&self, content: &[u8], _signature: Option<&[u8]>) -> anyhow::Result<Verified> {
        let text = std::str::from_utf8(content).context("scripts must be UTF-8 text")?;
        let (body, block) = split_block(text);
        let block = block.ok_or_else(|| anyhow!("script is not signed"))?;
        if !block.lines().any(|line| line.trim_end() == BLOCK_END) {
            anyhow::bail!("signature block is not terminated");
        }
        SignatureBlock::parse(block, LINE_PREFIX)?.verify(&normalize(body))
    }
}
