// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Detached signatures over arbitrary content.

use std::{
    io::Read,
    path::{Path, PathBuf},
};

use anyhow::anyhow;

use super::{
    atomic::{self, Destination},
    format::{
        FlagDef, FormatModule, InputStream, SignOptions, SignatureBlock, Transform, Verified,
    },
    token::LocalKey,
};

const ARMOR_BEGIN: &str = "-----BEGIN SIGRELAY SIGNATURE-----";
const ARMOR_END: &str = "-----END SIGRELAY SIGNATURE-----";

/// Signs any content, producing a separate signature file.
pub struct Raw;

struct RawTransform {
    content: Vec<u8>,
}

impl Transform for RawTransform {
    fn to_be_signed(&self) -> anyhow::Result<Box<dyn Read + Send + '_>> {
        Ok(Box::new(self.content.as_slice()))
    }

    fn apply(
        &self,
        destination: &Destination,
        _mime_type: &str,
        signed: &[u8],
    ) -> anyhow::Result<()> {
        Ok(atomic::write(destination, signed)?)
    }
}

impl FormatModule for Raw {
    fn name(&self) -> &'static str {
        "raw"
    }

    fn flags(&self) -> &'static [FlagDef] {
        &[FlagDef {
            name: "armor",
            description: "Wrap the signature in BEGIN/END lines",
        }]
    }

    fn mime_type(&self) -> &'static str {
        "text/plain"
    }

    fn allow_stdin(&self) -> bool {
        true
    }

    fn default_output(&self, input: &Path) -> PathBuf {
        let mut output = input.as_os_str().to_owned();
        output.push(".sig");
        output.into()
    }

    fn transform(
        &self,
        input: &mut dyn InputStream,
        _options: &SignOptions,
    ) -> anyhow::Result<Box<dyn Transform>> {
        let mut content = vec![];
        input.read_to_end(&mut content)?;
        Ok(Box::new(RawTransform { content }))
    }

    fn sign(
        &self,
        payload: &[u8],
        key: &LocalKey,
        options: &SignOptions,
    ) -> anyhow::Result<Vec<u8>> {
        let block = SignatureBlock::create(payload, key, options.digest)?.render("")?;
        if options.flag_enabled("armor") {
            Ok(format!("{ARMOR_BEGIN}\n{block}{ARMOR_END}\n").into_bytes())
        } else {
            Ok(block.into_bytes())
        }
    }

    fn verify(&self, content: &[u8], signature: Option<&[u8]>) -> anyhow::Result<Verified> {
        let signature =
            signature.ok_or_else(|| anyhow!("raw signatures are detached; a signature is required"))?;
        let text = std::str::from_utf8(signature)?;
        let text = text
            .lines()
            .filter(|line| *line != ARMOR_BEGIN && *line != ARMOR_END)
            .collect::<Vec<_>>()
            .join("\n");
        SignatureBlock::parse(&text, "")?.verify(content)
    }
}
