//! Message compression support. Each algorithm is enabled by a cargo feature;
//! the noop compressor id is always understood on the decompression path.

use std::str::FromStr;

use crate::error::{Error, ErrorKind, Result};

pub(crate) const NOOP_COMPRESSOR_ID: u8 = 0;
#[cfg(feature = "snappy-compression")]
pub(crate) const SNAPPY_COMPRESSOR_ID: u8 = 1;
#[cfg(feature = "zlib-compression")]
pub(crate) const ZLIB_COMPRESSOR_ID: u8 = 2;
#[cfg(feature = "zstd-compression")]
pub(crate) const ZSTD_COMPRESSOR_ID: u8 = 3;

/// The compressors that may be used to compress messages sent to the server.
/// The server picks whichever of these it also supports; replies are
/// decompressed with whatever compressor the server used, independent of this
/// choice.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Compressor {
    /// `zstd` compression.
    #[cfg(feature = "zstd-compression")]
    Zstd {
        /// The compression level to use; defaults to the zstd default level.
        level: Option<i32>,
    },
    /// `zlib` compression.
    #[cfg(feature = "zlib-compression")]
    Zlib {
        /// The compression level to use, 0-9; defaults to the zlib default.
        level: Option<u32>,
    },
    /// `snappy` compression.
    #[cfg(feature = "snappy-compression")]
    Snappy,
}

impl Compressor {
    pub(crate) fn name(&self) -> &'static str {
        match *self {
            #[cfg(feature = "zstd-compression")]
            Compressor::Zstd { .. } => "zstd",
            #[cfg(feature = "zlib-compression")]
            Compressor::Zlib { .. } => "zlib",
            #[cfg(feature = "snappy-compression")]
            Compressor::Snappy => "snappy",
        }
    }

    pub(crate) fn id(&self) -> u8 {
        match *self {
            #[cfg(feature = "zstd-compression")]
            Compressor::Zstd { .. } => ZSTD_COMPRESSOR_ID,
            #[cfg(feature = "zlib-compression")]
            Compressor::Zlib { .. } => ZLIB_COMPRESSOR_ID,
            #[cfg(feature = "snappy-compression")]
            Compressor::Snappy => SNAPPY_COMPRESSOR_ID,
        }
    }

    /// Validates any user-provided compression level.
    pub fn validate(&self) -> Result<()> {
        #[cfg(feature = "zstd-compression")]
        if let Self::Zstd { level: Some(level) } = self {
            let valid_levels = zstd::compression_level_range();
            if !valid_levels.contains(level) {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "invalid zstd compression level {}: must be within {:?}",
                        level, valid_levels
                    ),
                }
                .into());
            }
        }

        #[cfg(feature = "zlib-compression")]
        if let Self::Zlib { level: Some(level) } = self {
            if *level > 9 {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "invalid zlib compression level {}: must be between 0 and 9",
                        level
                    ),
                }
                .into());
            }
        }

        Ok(())
    }

    /// Compresses the flag bytes and section bytes of an op-message into the
    /// payload of a compressed envelope.
    pub(crate) fn compress(&self, flag_bytes: &[u8], section_bytes: &[u8]) -> Result<Vec<u8>> {
        let result = match *self {
            #[cfg(feature = "zstd-compression")]
            Self::Zstd { level } => compress_zstd(level, flag_bytes, section_bytes),
            #[cfg(feature = "zlib-compression")]
            Self::Zlib { level } => compress_zlib(level, flag_bytes, section_bytes),
            #[cfg(feature = "snappy-compression")]
            Self::Snappy => compress_snappy(flag_bytes, section_bytes),
        };

        result.map_err(|error| {
            ErrorKind::Internal {
                message: format!(
                    "failed to compress message with {} compression: {}",
                    self.name(),
                    error
                ),
            }
            .into()
        })
    }
}

impl FromStr for Compressor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            #[cfg(feature = "zstd-compression")]
            "zstd" => Ok(Self::Zstd { level: None }),
            #[cfg(feature = "zlib-compression")]
            "zlib" => Ok(Self::Zlib { level: None }),
            #[cfg(feature = "snappy-compression")]
            "snappy" => Ok(Self::Snappy),
            other if other == "zstd" || other == "zlib" || other == "snappy" => {
                Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "enable the {}-compression feature flag to use {} compression",
                        other, other
                    ),
                }
                .into())
            }
            other => Err(ErrorKind::InvalidArgument {
                message: format!("unsupported compressor: {}", other),
            }
            .into()),
        }
    }
}

#[cfg(feature = "zstd-compression")]
fn compress_zstd(
    level: Option<i32>,
    flag_bytes: &[u8],
    section_bytes: &[u8],
) -> std::io::Result<Vec<u8>> {
    use std::io::Write;

    use zstd::{Encoder, DEFAULT_COMPRESSION_LEVEL};

    let mut encoder = Encoder::new(Vec::new(), level.unwrap_or(DEFAULT_COMPRESSION_LEVEL))?;
    encoder.write_all(flag_bytes)?;
    encoder.write_all(section_bytes)?;
    encoder.finish()
}

#[cfg(feature = "zlib-compression")]
fn compress_zlib(
    level: Option<u32>,
    flag_bytes: &[u8],
    section_bytes: &[u8],
) -> std::io::Result<Vec<u8>> {
    use std::io::Write;

    use flate2::{write::ZlibEncoder, Compression};

    let level = match level {
        Some(level) => Compression::new(level),
        None => Compression::default(),
    };
    let mut encoder = ZlibEncoder::new(Vec::new(), level);
    encoder.write_all(flag_bytes)?;
    encoder.write_all(section_bytes)?;
    encoder.finish()
}

#[cfg(feature = "snappy-compression")]
fn compress_snappy(flag_bytes: &[u8], section_bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    use snap::raw::Encoder;

    let mut uncompressed = flag_bytes.to_vec();
    uncompressed.extend_from_slice(section_bytes);

    let mut encoder = Encoder::new();
    Ok(encoder.compress_vec(&uncompressed)?)
}

/// Decompresses a compressed-envelope payload with the algorithm indicated by
/// `compressor_id`. Fails if the id names an algorithm this build does not
/// support.
pub(crate) fn decompress_message(message: &[u8], compressor_id: u8) -> Result<Vec<u8>> {
    if compressor_id == NOOP_COMPRESSOR_ID {
        return Ok(message.into());
    }

    #[cfg(feature = "zstd-compression")]
    if compressor_id == ZSTD_COMPRESSOR_ID {
        return decompress_zstd(message);
    }

    #[cfg(feature = "zlib-compression")]
    if compressor_id == ZLIB_COMPRESSOR_ID {
        return decompress_zlib(message);
    }

    #[cfg(feature = "snappy-compression")]
    if compressor_id == SNAPPY_COMPRESSOR_ID {
        return decompress_snappy(message);
    }

    Err(ErrorKind::InvalidResponse {
        message: format!(
            "unsupported compressor ID returned from the server: {}",
            compressor_id
        ),
    }
    .into())
}

#[cfg(feature = "zstd-compression")]
fn decompress_zstd(message: &[u8]) -> Result<Vec<u8>> {
    let mut decompressed = Vec::new();
    zstd::stream::copy_decode(message, &mut decompressed).map_err(|error| {
        ErrorKind::Internal {
            message: format!("could not decompress message with zstd: {}", error),
        }
    })?;
    Ok(decompressed)
}

#[cfg(feature = "zlib-compression")]
fn decompress_zlib(message: &[u8]) -> Result<Vec<u8>> {
    use std::io::Write;

    use flate2::write::ZlibDecoder;

    let mut decoder = ZlibDecoder::new(Vec::new());
    decoder.write_all(message)?;
    decoder.finish().map_err(|error| {
        ErrorKind::Internal {
            message: format!("could not decompress message with zlib: {}", error),
        }
        .into()
    })
}

#[cfg(feature = "snappy-compression")]
fn decompress_snappy(message: &[u8]) -> Result<Vec<u8>> {
    use snap::raw::Decoder;

    let mut decoder = Decoder::new();
    decoder.decompress_vec(message).map_err(|error| {
        ErrorKind::Internal {
            message: format!("could not decompress message with snappy: {}", error),
        }
        .into()
    })
}
