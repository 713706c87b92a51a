//! Persisted array stores
//!
//! A store is a named container of shaped, typed array datasets. Two backends are
//! provided: a Zarr v2 directory store with gzip, zlib and shuffle chunk codecs,
//! which supports several workers at once, and a NetCDF file, which is standalone
//! only. Both are driven through the [`Store`] trait.

pub mod codec;
pub mod netcdf_io;
pub mod zarr;

use crate::errors::{CoReduceError, Result};
use async_trait::async_trait;
use ndarray::{Array1, ArrayView2};
use serde_json::{Map, Value as JsonValue};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub use self::netcdf_io::NetcdfStore;
pub use self::zarr::ZarrStore;

/// Element type of a dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DType {
    F32,
    F64,
    /// Anything else, kept verbatim for error reporting
    Other(String),
}

impl DType {
    #[must_use]
    pub const fn is_float(&self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    /// Size of one element in bytes, for float types.
    #[must_use]
    pub const fn item_size(&self) -> Option<usize> {
        match self {
            Self::F32 => Some(4),
            Self::F64 => Some(8),
            Self::Other(_) => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => f.write_str("f32"),
            Self::F64 => f.write_str("f64"),
            Self::Other(raw) => f.write_str(raw),
        }
    }
}

/// Shape, type and dimension names of one dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetInfo {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub dimensions: Vec<String>,
}

impl DatasetInfo {
    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }
}

/// Description of a dataset to (re)create
#[derive(Debug, Clone)]
pub struct DatasetSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub dtype: DType,
    pub dimensions: Vec<String>,
    pub attributes: Map<String, JsonValue>,
}

/// How a store is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    /// Read/write, creating the store if needed
    #[default]
    Append,
    /// Read/write, the store must exist
    ReadWrite,
    /// Read only, the store must exist
    ReadOnly,
}

impl OpenMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Append => "append",
            Self::ReadWrite => "read-write",
            Self::ReadOnly => "read-only",
        }
    }

    #[must_use]
    pub const fn is_writable(self) -> bool {
        !matches!(self, Self::ReadOnly)
    }
}

impl FromStr for OpenMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "append" | "a" => Ok(Self::Append),
            "read-write" | "rw" | "r+" => Ok(Self::ReadWrite),
            "read-only" | "r" => Ok(Self::ReadOnly),
            other => Err(format!(
                "unknown open mode '{other}', expected append, read-write or read-only"
            )),
        }
    }
}

/// Backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreFormat {
    /// NetCDF for `.nc`, `.nc4`, `.netcdf`, `.h5` and `.hdf5` paths, Zarr otherwise
    #[default]
    Auto,
    Zarr,
    NetCDF,
}

impl StoreFormat {
    /// Resolve [`StoreFormat::Auto`] against a path.
    #[must_use]
    pub fn resolve(self, path: &Path) -> Self {
        match self {
            Self::Auto => {
                let netcdf_ext = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(str::to_ascii_lowercase)
                    .is_some_and(|e| matches!(e.as_str(), "nc" | "nc4" | "netcdf" | "h5" | "hdf5"));
                if netcdf_ext {
                    Self::NetCDF
                } else {
                    Self::Zarr
                }
            }
            other => other,
        }
    }
}

impl FromStr for StoreFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "zarr" => Ok(Self::Zarr),
            "netcdf" | "nc" => Ok(Self::NetCDF),
            other => Err(format!(
                "unknown store format '{other}', expected auto, zarr or netcdf"
            )),
        }
    }
}

/// Backend-neutral access to the datasets of one store
///
/// Mutating calls are only issued by the committer; the reduction engine reads
/// through [`Store::read_lane`] alone.
#[async_trait(?Send)]
pub trait Store {
    /// Backend name used in logs and errors
    fn backend(&self) -> &'static str;

    /// Location of the store on disk
    fn location(&self) -> &Path;

    fn mode(&self) -> OpenMode;

    /// Whether several processes may open this store at the same time
    fn supports_collective(&self) -> bool;

    /// Describe a dataset.
    ///
    /// Returns `Ok(None)` when nothing named `name` exists.
    ///
    /// # Errors
    ///
    /// [`CoReduceError::NotADataset`] when `name` exists but is not an array.
    async fn dataset_info(&self, name: &str) -> Result<Option<DatasetInfo>>;

    /// Read the samples at `(unit, sub_unit, ..)` of a rank-3 dataset.
    async fn read_lane(&self, name: &str, unit: usize, sub_unit: usize) -> Result<Array1<f64>>;

    /// Make `spec.name` a fresh dataset with every cell at the fill value.
    ///
    /// Any previous dataset of that name is discarded.
    async fn recreate_dataset(&mut self, spec: &DatasetSpec) -> Result<()>;

    /// Write the listed rows of `values` into a rank-2 dataset.
    async fn write_rows(&mut self, name: &str, rows: &[usize], values: ArrayView2<'_, f64>)
        -> Result<()>;

    /// Flush pending writes.
    async fn flush(&mut self) -> Result<()>;
}

/// Open a store with the backend chosen by `format`.
///
/// # Errors
///
/// Returns [`CoReduceError::StoreNotFound`] when the store is missing and `mode`
/// does not create it, or any backend error.
pub async fn open_store(path: &Path, mode: OpenMode, format: StoreFormat) -> Result<Box<dyn Store>> {
    match format.resolve(path) {
        StoreFormat::NetCDF => Ok(Box::new(NetcdfStore::open(path, mode)?)),
        _ => Ok(Box::new(ZarrStore::open(path, mode).await?)),
    }
}

/// Check that `name` is an array of the expected rank.
///
/// # Errors
///
/// [`CoReduceError::DatasetNotFound`], [`CoReduceError::NotADataset`] or
/// [`CoReduceError::RankMismatch`].
pub async fn validate_dataset(
    store: &dyn Store,
    name: &str,
    expected_rank: usize,
) -> Result<DatasetInfo> {
    let info = store
        .dataset_info(name)
        .await?
        .ok_or_else(|| CoReduceError::DatasetNotFound {
            name: name.to_string(),
            store: store.location().display().to_string(),
        })?;

    if info.rank() != expected_rank {
        return Err(CoReduceError::RankMismatch {
            name: name.to_string(),
            expected: expected_rank,
            actual: info.rank(),
            shape: info.shape,
        });
    }
    if !info.dtype.is_float() {
        return Err(CoReduceError::UnsupportedDataType {
            name: name.to_string(),
            dtype: info.dtype.to_string(),
        });
    }

    Ok(info)
}

/// Map a `/`-separated dataset name onto a path below `root`.
pub(crate) fn dataset_path(root: &Path, name: &str) -> Result<PathBuf> {
    let mut path = root.to_path_buf();
    let mut components = 0;
    for part in name.split('/').filter(|p| !p.is_empty()) {
        if crate::utils::is_reserved_component(part) {
            return Err(CoReduceError::InvalidDatasetName(name.to_string()));
        }
        path.push(part);
        components += 1;
    }
    if components == 0 {
        return Err(CoReduceError::InvalidDatasetName(name.to_string()));
    }
    Ok(path)
}
