//! Zarr chunk codecs
//!
//! The numcodecs compressors and filters a `.zarray` document may name. Encoding
//! applies the filters in order and then the compressor; decoding runs the same
//! pipeline backwards.

use crate::errors::{CoReduceError, Result};
use flate2::read::{GzDecoder, GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde_json::{json, Value as JsonValue};
use std::io::Read;
use std::path::Path;
use zune_inflate::{DeflateDecoder, DeflateOptions};

/// numcodecs default for both deflate compressors
const DEFAULT_LEVEL: u32 = 1;

/// Whole-chunk compressor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compressor {
    Gzip { level: u32 },
    Zlib { level: u32 },
}

/// Byte filter applied before compression
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    /// Byte shuffle: the first byte of every element, then the second, and so on
    Shuffle { element_size: usize },
}

/// Filters and compressor of one array
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecPipeline {
    pub filters: Vec<Filter>,
    pub compressor: Option<Compressor>,
}

impl Compressor {
    fn from_json(config: &JsonValue, path: &Path) -> Result<Self> {
        let level = config
            .get("level")
            .and_then(JsonValue::as_u64)
            .and_then(|level| u32::try_from(level).ok())
            .unwrap_or(DEFAULT_LEVEL);
        match codec_id(config, path)? {
            "gzip" => Ok(Self::Gzip { level }),
            "zlib" => Ok(Self::Zlib { level }),
            other => Err(unsupported(path, other)),
        }
    }

    fn to_json(self) -> JsonValue {
        match self {
            Self::Gzip { level } => json!({ "id": "gzip", "level": level }),
            Self::Zlib { level } => json!({ "id": "zlib", "level": level }),
        }
    }

    fn compress(self, data: &[u8]) -> Result<Vec<u8>> {
        let mut compressed = Vec::new();
        match self {
            Self::Gzip { level } => {
                GzEncoder::new(data, Compression::new(level)).read_to_end(&mut compressed)?;
            }
            Self::Zlib { level } => {
                ZlibEncoder::new(data, Compression::new(level)).read_to_end(&mut compressed)?;
            }
        }
        Ok(compressed)
    }

    fn decompress(self, data: &[u8], size_hint: usize) -> Result<Vec<u8>> {
        match self {
            Self::Gzip { .. } => {
                let mut decompressed = Vec::with_capacity(size_hint);
                GzDecoder::new(data).read_to_end(&mut decompressed)?;
                Ok(decompressed)
            }
            Self::Zlib { .. } => {
                let options = DeflateOptions::default().set_size_hint(size_hint);
                let mut decoder = DeflateDecoder::new_with_options(data, options);
                Ok(decoder.decode_zlib()?)
            }
        }
    }
}

impl Filter {
    fn from_json(config: &JsonValue, path: &Path) -> Result<Self> {
        match codec_id(config, path)? {
            "shuffle" => {
                let element_size = config
                    .get("elementsize")
                    .and_then(JsonValue::as_u64)
                    .and_then(|size| usize::try_from(size).ok())
                    .filter(|&size| size > 0)
                    .unwrap_or(4);
                Ok(Self::Shuffle { element_size })
            }
            other => Err(unsupported(path, other)),
        }
    }

    fn to_json(self) -> JsonValue {
        match self {
            Self::Shuffle { element_size } => json!({ "id": "shuffle", "elementsize": element_size }),
        }
    }

    fn encode(self, data: &[u8], path: &Path) -> Result<Vec<u8>> {
        match self {
            Self::Shuffle { element_size } => {
                let elements = whole_elements(data, element_size, path)?;
                let mut shuffled = vec![0; data.len()];
                for (i, element) in data.chunks_exact(element_size).enumerate() {
                    for (b, &byte) in element.iter().enumerate() {
                        shuffled[b * elements + i] = byte;
                    }
                }
                Ok(shuffled)
            }
        }
    }

    fn decode(self, data: &[u8], path: &Path) -> Result<Vec<u8>> {
        match self {
            Self::Shuffle { element_size } => {
                let elements = whole_elements(data, element_size, path)?;
                let mut unshuffled = vec![0; data.len()];
                for (b, plane) in data.chunks_exact(elements.max(1)).enumerate() {
                    for (i, &byte) in plane.iter().enumerate() {
                        unshuffled[i * element_size + b] = byte;
                    }
                }
                Ok(unshuffled)
            }
        }
    }
}

impl CodecPipeline {
    /// Parse the `compressor` and `filters` entries of a `.zarray` document.
    ///
    /// # Errors
    ///
    /// [`CoReduceError::UnsupportedCodec`] for a codec id this crate cannot decode, or
    /// [`CoReduceError::CorruptMetadata`] for an entry without an id.
    pub fn from_metadata(
        compressor: Option<&JsonValue>,
        filters: Option<&JsonValue>,
        path: &Path,
    ) -> Result<Self> {
        let compressor = match compressor {
            None | Some(JsonValue::Null) => None,
            Some(config) => Some(Compressor::from_json(config, path)?),
        };
        let filters = match filters {
            None | Some(JsonValue::Null) => Vec::new(),
            Some(JsonValue::Array(configs)) => configs
                .iter()
                .map(|config| Filter::from_json(config, path))
                .collect::<Result<_>>()?,
            Some(other) => {
                return Err(CoReduceError::CorruptMetadata {
                    path: path.display().to_string(),
                    message: format!("filters must be a list, found {other}"),
                })
            }
        };
        Ok(Self {
            filters,
            compressor,
        })
    }

    /// The `compressor` entry, `null` when chunks are stored raw.
    #[must_use]
    pub fn compressor_json(&self) -> Option<JsonValue> {
        self.compressor.map(Compressor::to_json)
    }

    /// The `filters` entry, `null` when there are none.
    #[must_use]
    pub fn filters_json(&self) -> Option<JsonValue> {
        if self.filters.is_empty() {
            None
        } else {
            Some(JsonValue::Array(
                self.filters.iter().map(|f| f.to_json()).collect(),
            ))
        }
    }

    /// Encode raw chunk bytes for storage.
    ///
    /// # Errors
    ///
    /// Any filter or compressor failure.
    pub fn encode(&self, raw: Vec<u8>, path: &Path) -> Result<Vec<u8>> {
        let mut data = raw;
        for filter in &self.filters {
            data = filter.encode(&data, path)?;
        }
        match self.compressor {
            Some(compressor) => compressor.compress(&data),
            None => Ok(data),
        }
    }

    /// Decode stored chunk bytes; `raw_len` is the expected decoded size.
    ///
    /// # Errors
    ///
    /// [`CoReduceError::Decompression`] or an I/O error for a damaged stream, or
    /// [`CoReduceError::CorruptMetadata`] when a filter does not fit the data.
    pub fn decode(&self, stored: Vec<u8>, raw_len: usize, path: &Path) -> Result<Vec<u8>> {
        let mut data = match self.compressor {
            Some(compressor) => compressor.decompress(&stored, raw_len)?,
            None => stored,
        };
        for filter in self.filters.iter().rev() {
            data = filter.decode(&data, path)?;
        }
        Ok(data)
    }
}

fn codec_id<'a>(config: &'a JsonValue, path: &Path) -> Result<&'a str> {
    config
        .get("id")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| CoReduceError::CorruptMetadata {
            path: path.display().to_string(),
            message: format!("codec without an id: {config}"),
        })
}

fn unsupported(path: &Path, codec: &str) -> CoReduceError {
    CoReduceError::UnsupportedCodec {
        path: path.display().to_string(),
        codec: codec.to_string(),
    }
}

fn whole_elements(data: &[u8], element_size: usize, path: &Path) -> Result<usize> {
    if data.len() % element_size == 0 {
        Ok(data.len() / element_size)
    } else {
        Err(CoReduceError::CorruptMetadata {
            path: path.display().to_string(),
            message: format!(
                "{} bytes do not split into {element_size}-byte elements",
                data.len()
            ),
        })
    }
}
