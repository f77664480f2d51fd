// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Content-encoding negotiation for request and response bodies.
//!
//! The client advertises the encodings it is willing to use in `Accept-Encoding` and compresses
//! request bodies with the first one the server listed in its directory response. Servers that
//! don't understand a request encoding answer with `406 Not Acceptable`, after which the client
//! retries without compression.

use std::{
    fmt::Display,
    io::{self, Read, Write},
    pin::Pin,
    str::FromStr,
    task::{ready, Context, Poll},
};

use bytes::Bytes;
use flate2::{
    read::{GzDecoder, GzEncoder, ZlibDecoder, ZlibEncoder},
    Compression,
};
use http::{header, HeaderMap, HeaderValue};
use tokio::io::{AsyncRead, ReadBuf};

/// The encodings this implementation can produce and consume, in order of preference.
pub const ACCEPTED_ENCODINGS: &str = "gzip, deflate";

/// A content encoding supported for bodies.
///
/// HTTP's "deflate" is the zlib format, not a raw deflate stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Identity,
    Gzip,
    Deflate,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Identity => "identity",
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
        }
    }
}

impl Display for Encoding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned for a `Content-Encoding` this implementation doesn't support.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unsupported content encoding '{0}'")]
pub struct UnsupportedEncoding(pub String);

impl From<UnsupportedEncoding> for io::Error {
    fn from(error: UnsupportedEncoding) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, error)
    }
}

impl FromStr for Encoding {
    type Err = UnsupportedEncoding;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.split(';').next().unwrap_or_default().trim();
        match name.to_ascii_lowercase().as_str() {
            "" | "identity" => Ok(Encoding::Identity),
            "gzip" | "x-gzip" => Ok(Encoding::Gzip),
            "deflate" => Ok(Encoding::Deflate),
            _ => Err(UnsupportedEncoding(s.trim().to_string())),
        }
    }
}

/// Pick the encoding to use from a comma-separated list advertised by the peer.
///
/// The first supported entry wins; quality parameters are ignored. An empty list, or one with
/// nothing supported in it, yields [`Encoding::Identity`].
pub fn negotiate(list: &str) -> Encoding {
    list.split(',')
        .filter(|entry| !entry.trim().is_empty())
        .filter_map(|entry| entry.parse::<Encoding>().ok())
        .find(|encoding| *encoding != Encoding::Identity)
        .unwrap_or_default()
}

/// Compress a complete body.
pub fn compress(encoding: Encoding, body: &[u8]) -> io::Result<Bytes> {
    let mut compressed = Vec::with_capacity(body.len() / 2);
    match encoding {
        Encoding::Identity => return Ok(Bytes::copy_from_slice(body)),
        Encoding::Gzip => {
            GzEncoder::new(body, Compression::default()).read_to_end(&mut compressed)?;
        }
        Encoding::Deflate => {
            ZlibEncoder::new(body, Compression::default()).read_to_end(&mut compressed)?;
        }
    }
    Ok(compressed.into())
}

/// Decompress a complete body.
pub fn decompress(encoding: Encoding, body: &[u8]) -> io::Result<Bytes> {
    let mut decompressed = Vec::with_capacity(body.len() * 2);
    match encoding {
        Encoding::Identity => return Ok(Bytes::copy_from_slice(body)),
        Encoding::Gzip => {
            GzDecoder::new(body).read_to_end(&mut decompressed)?;
        }
        Encoding::Deflate => {
            ZlibDecoder::new(body).read_to_end(&mut decompressed)?;
        }
    }
    Ok(decompressed.into())
}

/// Determine the encoding of a message body from its headers.
pub fn content_encoding(headers: &HeaderMap) -> Result<Encoding, UnsupportedEncoding> {
    match headers.get(header::CONTENT_ENCODING) {
        None => Ok(Encoding::Identity),
        Some(value) => value
            .to_str()
            .map_err(|_| UnsupportedEncoding(String::from_utf8_lossy(value.as_bytes()).into()))?
            .parse(),
    }
}

/// Prepare an outgoing request for the given advertised encoding list.
///
/// When the list is non-empty it is sent as `Accept-Encoding`, and a non-empty body is
/// compressed with the negotiated encoding.
pub fn encode_request(request: &mut http::Request<Bytes>, list: &str) -> io::Result<()> {
    if list.is_empty() {
        return Ok(());
    }
    let accept = HeaderValue::from_str(list)
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))?;
    request.headers_mut().insert(header::ACCEPT_ENCODING, accept);

    let encoding = negotiate(list);
    if encoding == Encoding::Identity || request.body().is_empty() {
        return Ok(());
    }
    let compressed = compress(encoding, request.body())?;
    *request.body_mut() = compressed;
    request.headers_mut().insert(
        header::CONTENT_ENCODING,
        HeaderValue::from_static(encoding.as_str()),
    );
    request.headers_mut().remove(header::CONTENT_LENGTH);
    Ok(())
}

/// Decompress a response body in place according to its `Content-Encoding`, removing the header.
pub fn decode_response(response: &mut http::Response<Bytes>) -> io::Result<()> {
    let encoding = content_encoding(response.headers())?;
    response.headers_mut().remove(header::CONTENT_ENCODING);
    if encoding != Encoding::Identity {
        let decompressed = decompress(encoding, response.body())?;
        *response.body_mut() = decompressed;
        response.headers_mut().remove(header::CONTENT_LENGTH);
    }
    Ok(())
}

/// Compress an outgoing response if the request accepts a supported encoding.
pub fn encode_response(
    request_headers: &HeaderMap,
    response: &mut http::Response<Bytes>,
) -> io::Result<()> {
    let accepted = request_headers
        .get(header::ACCEPT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let encoding = negotiate(accepted);
    if encoding == Encoding::Identity || response.body().is_empty() {
        return Ok(());
    }
    let compressed = compress(encoding, response.body())?;
    *response.body_mut() = compressed;
    response.headers_mut().insert(
        header::CONTENT_ENCODING,
        HeaderValue::from_static(encoding.as_str()),
    );
    response.headers_mut().remove(header::CONTENT_LENGTH);
    Ok(())
}

enum Decoder {
    Identity(Vec<u8>),
    Gzip(flate2::write::GzDecoder<Vec<u8>>),
    Deflate(flate2::write::ZlibDecoder<Vec<u8>>),
}

impl Decoder {
    fn write_all(&mut self, input: &[u8]) -> io::Result<()> {
        match self {
            Decoder::Identity(output) => {
                output.extend_from_slice(input);
                Ok(())
            }
            Decoder::Gzip(decoder) => decoder.write_all(input),
            Decoder::Deflate(decoder) => decoder.write_all(input),
        }
    }

    fn finish(&mut self) -> io::Result<()> {
        match self {
            Decoder::Identity(_) => Ok(()),
            Decoder::Gzip(decoder) => decoder.try_finish(),
            Decoder::Deflate(decoder) => decoder.try_finish(),
        }
    }

    fn output(&mut self) -> &mut Vec<u8> {
        match self {
            Decoder::Identity(output) => output,
            Decoder::Gzip(decoder) => decoder.get_mut(),
            Decoder::Deflate(decoder) => decoder.get_mut(),
        }
    }
}

/// Streams the decompressed contents of a compressed [`AsyncRead`].
///
/// Used on the server to feed compressed request bodies into the signing tool without buffering
/// the whole body in memory. Errors from the underlying reader, including the `UnexpectedEof`
/// produced when a client hangs up, are passed through unchanged.
pub struct DecodingReader<R> {
    inner: R,
    decoder: Decoder,
    scratch: Box<[u8]>,
    finished: bool,
}

impl<R: AsyncRead + Unpin> DecodingReader<R> {
    /// Wrap a reader producing a body in the given encoding.
    pub fn new(inner: R, encoding: Encoding) -> Self {
        let decoder = match encoding {
            Encoding::Identity => Decoder::Identity(Vec::new()),
            Encoding::Gzip => Decoder::Gzip(flate2::write::GzDecoder::new(Vec::new())),
            Encoding::Deflate => Decoder::Deflate(flate2::write::ZlibDecoder::new(Vec::new())),
        };
        Self {
            inner,
            decoder,
            scratch: vec![0; 16 * 1024].into_boxed_slice(),
            finished: false,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for DecodingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            let pending = this.decoder.output();
            if !pending.is_empty() {
                let count = pending.len().min(buf.remaining());
                buf.put_slice(&pending[..count]);
                pending.drain(..count);
                return Poll::Ready(Ok(()));
            }
            if this.finished {
                return Poll::Ready(Ok(()));
            }

            let mut read_buf = ReadBuf::new(&mut this.scratch);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut read_buf))?;
            if read_buf.filled().is_empty() {
                this.decoder.finish()?;
                this.finished = true;
            } else {
                this.decoder.write_all(read_buf.filled())?;
            }
        }
    }
}
