//! Streaming compression for cache archives.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;
use tarstash_core::{Error, Result};

/// Compression algorithm wrapped around the tar stream.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    #[default]
    Zstd,
    Gzip,
    Lz4,
}

impl CompressionType {
    /// Content type recorded on objects saved with this algorithm.
    pub fn content_type(self) -> &'static str {
        match self {
            CompressionType::None => "application/x-tar",
            CompressionType::Zstd => "application/x-zstd-compressed-tar",
            CompressionType::Gzip => "application/x-compressed-tar",
            CompressionType::Lz4 => "application/x-lz4-compressed-tar",
        }
    }

    /// Pick the decoder for an object. Objects without a recognised content
    /// type are assumed to be zstd, which is what saves default to.
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        match content_type {
            Some("application/x-tar") => CompressionType::None,
            Some("application/x-compressed-tar") | Some("application/gzip") => {
                CompressionType::Gzip
            }
            Some("application/x-lz4-compressed-tar") => CompressionType::Lz4,
            _ => CompressionType::Zstd,
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompressionType::None => "none",
            CompressionType::Zstd => "zstd",
            CompressionType::Gzip => "gzip",
            CompressionType::Lz4 => "lz4",
        };
        f.write_str(name)
    }
}

impl FromStr for CompressionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CompressionType::None),
            "zstd" => Ok(CompressionType::Zstd),
            "gzip" => Ok(CompressionType::Gzip),
            "lz4" => Ok(CompressionType::Lz4),
            other => Err(Error::InvalidArgument(format!(
                "unknown compression: {}",
                other
            ))),
        }
    }
}

/// Run `body` against a compressing writer over `sink`, then finish the
/// compressed stream and hand `sink` back.
///
/// `level` is passed to zstd and gzip; `None` picks the codec default.
pub fn encode<W, F>(sink: W, algorithm: CompressionType, level: Option<i32>, body: F) -> Result<W>
where
    W: Write,
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    match algorithm {
        CompressionType::None => {
            let mut sink = sink;
            body(&mut sink)?;
            Ok(sink)
        }
        CompressionType::Zstd => {
            let level = level.unwrap_or(zstd::DEFAULT_COMPRESSION_LEVEL);
            let mut encoder = zstd::stream::write::Encoder::new(sink, level)
                .map_err(|e| Error::io("failed to start zstd stream", e))?;
            body(&mut encoder)?;
            encoder
                .finish()
                .map_err(|e| Error::io("failed to finish zstd stream", e))
        }
        CompressionType::Gzip => {
            let level = level
                .map(|l| flate2::Compression::new(l.clamp(0, 9) as u32))
                .unwrap_or_default();
            let mut encoder = flate2::write::GzEncoder::new(sink, level);
            body(&mut encoder)?;
            encoder
                .finish()
                .map_err(|e| Error::io("failed to finish gzip stream", e))
        }
        CompressionType::Lz4 => {
            let mut encoder = lz4_flex::frame::FrameEncoder::new(sink);
            body(&mut encoder)?;
            encoder
                .finish()
                .map_err(|e| Error::io("failed to finish lz4 stream", e.into()))
        }
    }
}

/// Run `body` against a decompressing reader over `source`.
pub fn decode<R, T, F>(source: R, algorithm: CompressionType, body: F) -> Result<T>
where
    R: Read,
    F: FnOnce(&mut dyn Read) -> Result<T>,
{
    match algorithm {
        CompressionType::None => {
            let mut source = source;
            body(&mut source)
        }
        CompressionType::Zstd => {
            let mut decoder = zstd::stream::read::Decoder::new(source)
                .map_err(|e| Error::io("failed to start zstd stream", e))?;
            body(&mut decoder)
        }
        CompressionType::Gzip => body(&mut flate2::read::GzDecoder::new(source)),
        CompressionType::Lz4 => body(&mut lz4_flex::frame::FrameDecoder::new(source)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(algorithm: CompressionType) {
        let data = b"Hello, World! This is a test of compression.".repeat(64);
        let compressed = encode(Vec::new(), algorithm, None, |w| {
            w.write_all(&data).map_err(|e| Error::io("write", e))
        })
        .unwrap();
        let decompressed = decode(compressed.as_slice(), algorithm, |r| {
            let mut out = Vec::new();
            r.read_to_end(&mut out).map_err(|e| Error::io("read", e))?;
            Ok(out)
        })
        .unwrap();
        assert_eq!(data, decompressed);
    }

    #[test]
    fn test_zstd_roundtrip() {
        roundtrip(CompressionType::Zstd);
    }

    #[test]
    fn test_gzip_roundtrip() {
        roundtrip(CompressionType::Gzip);
    }

    #[test]
    fn test_lz4_roundtrip() {
        roundtrip(CompressionType::Lz4);
    }

    #[test]
    fn test_content_type_mapping() {
        for algorithm in [
            CompressionType::None,
            CompressionType::Zstd,
            CompressionType::Gzip,
            CompressionType::Lz4,
        ] {
            assert_eq!(
                CompressionType::from_content_type(Some(algorithm.content_type())),
                algorithm
            );
        }
        assert_eq!(
            CompressionType::from_content_type(None),
            CompressionType::Zstd
        );
        assert_eq!(
            CompressionType::Zstd.content_type(),
            "application/x-zstd-compressed-tar"
        );
    }

    #[test]
    fn test_parse_compression() {
        assert_eq!("GZIP".parse::<CompressionType>().unwrap(), CompressionType::Gzip);
        assert!("brotli".parse::<CompressionType>().is_err());
    }
}
