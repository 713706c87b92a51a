//! Zarr v2 directory store
//!
//! Arrays are directories holding a `.zarray` document and little-endian, C-order
//! chunk files named by their grid coordinates. Chunks pass through the codecs of
//! [`super::codec`]; outputs are written raw. Output arrays are chunked one row
//! per chunk so that workers committing disjoint rows never touch the same file.

use super::codec::CodecPipeline;
use super::{dataset_path, DType, DatasetInfo, DatasetSpec, OpenMode, Store};
use crate::errors::{CoReduceError, Result};
use crate::utils::write_atomic;
use async_trait::async_trait;
use ndarray::{Array1, ArrayView2};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

const ZARRAY: &str = ".zarray";
const ZATTRS: &str = ".zattrs";
const ZGROUP: &str = ".zgroup";

/// Attribute under which xarray records dimension names
pub const DIMENSIONS_ATTR: &str = "_ARRAY_DIMENSIONS";

/// Contents of a `.zarray` document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrayMetadata {
    pub zarr_format: u8,
    pub shape: Vec<usize>,
    pub chunks: Vec<usize>,
    pub dtype: String,
    pub compressor: Option<JsonValue>,
    pub fill_value: JsonValue,
    pub order: String,
    pub filters: Option<JsonValue>,
    #[serde(default = "default_separator")]
    pub dimension_separator: String,
}

fn default_separator() -> String {
    ".".to_string()
}

impl ArrayMetadata {
    /// Uncompressed float array chunked one row at a time.
    #[must_use]
    pub fn row_chunked(shape: &[usize], dtype: &DType) -> Self {
        let chunks = shape
            .iter()
            .enumerate()
            .map(|(axis, &len)| if axis == 0 { 1 } else { len.max(1) })
            .collect();
        Self::new(shape.to_vec(), chunks, dtype)
    }

    #[must_use]
    pub fn new(shape: Vec<usize>, chunks: Vec<usize>, dtype: &DType) -> Self {
        let dtype = match dtype {
            DType::F32 => "<f4".to_string(),
            DType::F64 => "<f8".to_string(),
            DType::Other(raw) => raw.clone(),
        };
        Self {
            zarr_format: 2,
            shape,
            chunks,
            dtype,
            compressor: None,
            fill_value: json!("NaN"),
            order: "C".to_string(),
            filters: None,
            dimension_separator: default_separator(),
        }
    }

    #[must_use]
    pub fn data_type(&self) -> DType {
        match self.dtype.as_str() {
            "<f4" => DType::F32,
            "<f8" => DType::F64,
            other => DType::Other(other.to_string()),
        }
    }

    /// Fill value as a float, NaN when unset.
    #[must_use]
    pub fn fill(&self) -> f64 {
        match &self.fill_value {
            JsonValue::Number(n) => n.as_f64().unwrap_or(f64::NAN),
            JsonValue::String(s) if s == "Infinity" => f64::INFINITY,
            JsonValue::String(s) if s == "-Infinity" => f64::NEG_INFINITY,
            _ => f64::NAN,
        }
    }

    fn chunk_len(&self) -> usize {
        self.chunks.iter().product()
    }

    /// Number of chunks along each axis.
    fn grid(&self) -> Vec<usize> {
        self.shape
            .iter()
            .zip(&self.chunks)
            .map(|(&len, &chunk)| len.div_ceil(chunk))
            .collect()
    }

    /// Global coordinates of cell `local` of the chunk at grid position `origin`.
    fn global_coords(&self, origin: &[usize], local: &[usize]) -> Vec<usize> {
        origin
            .iter()
            .zip(&self.chunks)
            .zip(local)
            .map(|((&o, &c), &l)| o * c + l)
            .collect()
    }

    fn chunk_key(&self, coords: &[usize]) -> String {
        coords
            .iter()
            .map(usize::to_string)
            .collect::<Vec<_>>()
            .join(&self.dimension_separator)
    }

    /// Store chunks through `codecs`.
    #[must_use]
    pub fn with_codecs(mut self, codecs: &CodecPipeline) -> Self {
        self.compressor = codecs.compressor_json();
        self.filters = codecs.filters_json();
        self
    }

    /// Codecs named by the `compressor` and `filters` entries.
    ///
    /// # Errors
    ///
    /// See [`CodecPipeline::from_metadata`].
    pub fn codecs(&self, path: &Path) -> Result<CodecPipeline> {
        CodecPipeline::from_metadata(self.compressor.as_ref(), self.filters.as_ref(), path)
    }

    fn check_supported(&self, path: &Path) -> Result<()> {
        self.codecs(path)?;
        let problem = if self.zarr_format != 2 {
            Some(format!("unsupported zarr_format {}", self.zarr_format))
        } else if self.order != "C" {
            Some(format!("unsupported order '{}'", self.order))
        } else if self.chunks.len() != self.shape.len() || self.chunks.contains(&0) {
            Some(format!(
                "chunks {:?} do not fit shape {:?}",
                self.chunks, self.shape
            ))
        } else {
            None
        };
        match problem {
            Some(message) => Err(CoReduceError::CorruptMetadata {
                path: path.display().to_string(),
                message,
            }),
            None => Ok(()),
        }
    }
}

struct CachedChunk {
    path: PathBuf,
    values: Option<Vec<f64>>,
}

/// Zarr v2 store rooted at a directory
pub struct ZarrStore {
    root: PathBuf,
    mode: OpenMode,
    metadata: Mutex<HashMap<String, ArrayMetadata>>,
    last_chunk: Mutex<Option<CachedChunk>>,
}

impl ZarrStore {
    /// Open the store at `root`.
    ///
    /// [`OpenMode::Append`] creates the directory and its `.zgroup` when missing.
    ///
    /// # Errors
    ///
    /// [`CoReduceError::StoreNotFound`] when the directory is missing in other modes, or
    /// [`CoReduceError::CorruptMetadata`] when `root` is not a directory.
    pub async fn open(root: &Path, mode: OpenMode) -> Result<Self> {
        if !root.exists() {
            if mode != OpenMode::Append {
                return Err(CoReduceError::StoreNotFound(root.display().to_string()));
            }
            debug!(store = %root.display(), "creating zarr store");
            tokio::fs::create_dir_all(root).await?;
        }
        if !root.is_dir() {
            return Err(CoReduceError::CorruptMetadata {
                path: root.display().to_string(),
                message: "zarr store is not a directory".to_string(),
            });
        }

        let zgroup = root.join(ZGROUP);
        if mode.is_writable() && !zgroup.exists() {
            let body = serde_json::to_vec_pretty(&json!({ "zarr_format": 2 }))?;
            write_atomic(&zgroup, &body).await?;
        }

        Ok(Self {
            root: root.to_path_buf(),
            mode,
            metadata: Mutex::new(HashMap::new()),
            last_chunk: Mutex::new(None),
        })
    }

    async fn load_metadata(&self, name: &str) -> Result<ArrayMetadata> {
        if let Some(meta) = lock(&self.metadata).get(name) {
            return Ok(meta.clone());
        }

        let path = dataset_path(&self.root, name)?.join(ZARRAY);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoReduceError::DatasetNotFound {
                    name: name.to_string(),
                    store: self.root.display().to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let meta: ArrayMetadata =
            serde_json::from_slice(&body).map_err(|e| CoReduceError::CorruptMetadata {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        meta.check_supported(&path)?;

        lock(&self.metadata).insert(name.to_string(), meta.clone());
        Ok(meta)
    }

    async fn load_dimensions(&self, array_dir: &Path, rank: usize) -> Result<Vec<String>> {
        let fallback = || (0..rank).map(|i| format!("dim_{i}")).collect::<Vec<_>>();
        let body = match tokio::fs::read(array_dir.join(ZATTRS)).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(fallback()),
            Err(e) => return Err(e.into()),
        };
        let attrs: Map<String, JsonValue> = serde_json::from_slice(&body)?;
        let names: Option<Vec<String>> = attrs
            .get(DIMENSIONS_ATTR)
            .and_then(JsonValue::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(|n| n.as_str().map(str::to_string))
                    .collect()
            });
        Ok(names.filter(|n| n.len() == rank).unwrap_or_else(fallback))
    }

    /// Decoded chunk values, or `None` when the chunk was never written.
    async fn load_chunk(&self, meta: &ArrayMetadata, path: PathBuf) -> Result<Option<Vec<f64>>> {
        if let Some(cached) = lock(&self.last_chunk).as_ref() {
            if cached.path == path {
                return Ok(cached.values.clone());
            }
        }

        let values = match tokio::fs::read(&path).await {
            Ok(stored) => Some(decode_chunk(meta, stored, &path)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        *lock(&self.last_chunk) = Some(CachedChunk {
            path,
            values: values.clone(),
        });
        Ok(values)
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.mode.is_writable() {
            Ok(())
        } else {
            Err(CoReduceError::ReadOnlyStore(self.root.display().to_string()))
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Undo the codecs of a stored chunk and decode its values.
fn decode_chunk(meta: &ArrayMetadata, stored: Vec<u8>, path: &Path) -> Result<Vec<f64>> {
    let dtype = meta.data_type();
    let raw_len = meta.chunk_len() * dtype.item_size().unwrap_or(0);
    let raw = meta.codecs(path)?.decode(stored, raw_len, path)?;
    decode(&raw, &dtype, meta.chunk_len(), path)
}

fn decode(bytes: &[u8], dtype: &DType, expected: usize, path: &Path) -> Result<Vec<f64>> {
    let corrupt = |message: String| CoReduceError::CorruptMetadata {
        path: path.display().to_string(),
        message,
    };
    let item = dtype
        .item_size()
        .ok_or_else(|| corrupt(format!("cannot decode {dtype} chunks")))?;
    if bytes.len() != expected * item {
        return Err(corrupt(format!(
            "chunk holds {} bytes, expected {}",
            bytes.len(),
            expected * item
        )));
    }

    let values = match dtype {
        DType::F32 => bytes
            .chunks_exact(4)
            .map(|b| f64::from(f32::from_le_bytes([b[0], b[1], b[2], b[3]])))
            .collect(),
        _ => bytes
            .chunks_exact(8)
            .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
            .collect(),
    };
    Ok(values)
}

fn encode(values: impl Iterator<Item = f64>, dtype: &DType) -> Vec<u8> {
    match dtype {
        #[allow(clippy::cast_possible_truncation)]
        DType::F32 => values.flat_map(|v| (v as f32).to_le_bytes()).collect(),
        _ => values.flat_map(f64::to_le_bytes).collect(),
    }
}

#[async_trait(?Send)]
impl Store for ZarrStore {
    fn backend(&self) -> &'static str {
        "zarr"
    }

    fn location(&self) -> &Path {
        &self.root
    }

    fn mode(&self) -> OpenMode {
        self.mode
    }

    fn supports_collective(&self) -> bool {
        true
    }

    async fn dataset_info(&self, name: &str) -> Result<Option<DatasetInfo>> {
        let array_dir = dataset_path(&self.root, name)?;
        if !array_dir.exists() {
            return Ok(None);
        }
        if !array_dir.join(ZARRAY).is_file() {
            return Err(CoReduceError::NotADataset {
                name: name.to_string(),
            });
        }

        let meta = self.load_metadata(name).await?;
        let dimensions = self.load_dimensions(&array_dir, meta.shape.len()).await?;
        Ok(Some(DatasetInfo {
            name: name.to_string(),
            shape: meta.shape.clone(),
            dtype: meta.data_type(),
            dimensions,
        }))
    }

    async fn read_lane(&self, name: &str, unit: usize, sub_unit: usize) -> Result<Array1<f64>> {
        let meta = self.load_metadata(name).await?;
        if meta.shape.len() != 3 {
            return Err(CoReduceError::RankMismatch {
                name: name.to_string(),
                expected: 3,
                actual: meta.shape.len(),
                shape: meta.shape,
            });
        }

        let (samples, [c0, c1, c2]) = (meta.shape[2], [meta.chunks[0], meta.chunks[1], meta.chunks[2]]);
        let array_dir = dataset_path(&self.root, name)?;
        let fill = meta.fill();
        let offset = (unit % c0 * c1 + sub_unit % c1) * c2;

        let mut lane = Vec::with_capacity(samples);
        for chunk_k in 0..samples.div_ceil(c2) {
            let key = meta.chunk_key(&[unit / c0, sub_unit / c1, chunk_k]);
            let chunk = self.load_chunk(&meta, array_dir.join(key)).await?;
            let take = c2.min(samples - chunk_k * c2);
            match chunk {
                Some(values) => lane.extend_from_slice(&values[offset..offset + take]),
                None => lane.extend(std::iter::repeat(fill).take(take)),
            }
        }
        Ok(Array1::from(lane))
    }

    async fn recreate_dataset(&mut self, spec: &DatasetSpec) -> Result<()> {
        self.ensure_writable()?;
        let array_dir = dataset_path(&self.root, &spec.name)?;

        if array_dir.exists() {
            debug!(dataset = %spec.name, "removing existing dataset");
            tokio::fs::remove_dir_all(&array_dir).await?;
        }
        lock(&self.metadata).remove(&spec.name);
        *lock(&self.last_chunk) = None;
        tokio::fs::create_dir_all(&array_dir).await?;

        let meta = ArrayMetadata::row_chunked(&spec.shape, &spec.dtype);
        write_atomic(&array_dir.join(ZARRAY), &serde_json::to_vec_pretty(&meta)?).await?;

        let mut attributes = spec.attributes.clone();
        attributes.insert(DIMENSIONS_ATTR.to_string(), json!(spec.dimensions));
        write_atomic(&array_dir.join(ZATTRS), &serde_json::to_vec_pretty(&attributes)?).await?;

        lock(&self.metadata).insert(spec.name.clone(), meta);
        Ok(())
    }

    async fn write_rows(
        &mut self,
        name: &str,
        rows: &[usize],
        values: ArrayView2<'_, f64>,
    ) -> Result<()> {
        self.ensure_writable()?;
        // Drop cached metadata: another worker may have recreated the array.
        lock(&self.metadata).remove(name);
        let meta = self.load_metadata(name).await?;
        let array_dir = dataset_path(&self.root, name)?;

        if meta.shape.len() != 2 || meta.chunks[0] != 1 || meta.chunks[1] < meta.shape[1] {
            return Err(CoReduceError::CorruptMetadata {
                path: array_dir.display().to_string(),
                message: format!("array is not row-chunked (chunks {:?})", meta.chunks),
            });
        }

        let dtype = meta.data_type();
        let codecs = meta.codecs(&array_dir)?;
        let padding = meta.chunks[1] - meta.shape[1];
        let fill = meta.fill();
        for &row in rows {
            let row_values = values.row(row);
            let cells = row_values
                .iter()
                .copied()
                .chain(std::iter::repeat(fill).take(padding));
            let path = array_dir.join(meta.chunk_key(&[row, 0]));
            let stored = codecs.encode(encode(cells, &dtype), &path)?;
            write_atomic(&path, &stored).await?;
        }
        debug!(dataset = %name, rows = rows.len(), "wrote row chunks");
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        *lock(&self.last_chunk) = None;
        Ok(())
    }
}

/// Write a whole array into the store, chunked as given and stored raw.
///
/// Used to seed input datasets; the reduction itself only writes row chunks.
///
/// # Errors
///
/// Returns an error if the store is read-only, the chunk shape does not fit the data,
/// or any file cannot be written.
pub async fn write_array(
    store: &ZarrStore,
    name: &str,
    data: &ndarray::ArrayD<f64>,
    chunks: &[usize],
    dtype: &DType,
    dimensions: Option<&[String]>,
) -> Result<()> {
    let codecs = CodecPipeline::default();
    write_encoded_array(store, name, data, chunks, dtype, dimensions, &codecs).await
}

/// [`write_array`] with every chunk passed through `codecs`.
///
/// # Errors
///
/// See [`write_array`].
pub async fn write_encoded_array(
    store: &ZarrStore,
    name: &str,
    data: &ndarray::ArrayD<f64>,
    chunks: &[usize],
    dtype: &DType,
    dimensions: Option<&[String]>,
    codecs: &CodecPipeline,
) -> Result<()> {
    store.ensure_writable()?;
    let meta = ArrayMetadata::new(data.shape().to_vec(), chunks.to_vec(), dtype).with_codecs(codecs);
    let array_dir = dataset_path(&store.root, name)?;
    meta.check_supported(&array_dir)?;

    if array_dir.exists() {
        tokio::fs::remove_dir_all(&array_dir).await?;
    }
    tokio::fs::create_dir_all(&array_dir).await?;
    write_atomic(&array_dir.join(ZARRAY), &serde_json::to_vec_pretty(&meta)?).await?;
    if let Some(dimensions) = dimensions {
        let attrs = json!({ DIMENSIONS_ATTR: dimensions });
        write_atomic(&array_dir.join(ZATTRS), &serde_json::to_vec_pretty(&attrs)?).await?;
    }

    let grid = meta.grid();
    let fill = meta.fill();

    for chunk_index in 0..grid.iter().product::<usize>() {
        let origin = unravel(chunk_index, &grid);
        let cells: Vec<f64> = (0..meta.chunk_len())
            .map(|local_index| {
                let global = meta.global_coords(&origin, &unravel(local_index, chunks));
                data.get(global.as_slice()).copied().unwrap_or(fill)
            })
            .collect();
        let path = array_dir.join(meta.chunk_key(&origin));
        let stored = codecs.encode(encode(cells.into_iter(), dtype), &path)?;
        write_atomic(&path, &stored).await?;
    }

    lock(&store.metadata).remove(name);
    *lock(&store.last_chunk) = None;
    Ok(())
}

/// Read a whole array, with never-written chunks at the fill value.
///
/// # Errors
///
/// [`CoReduceError::DatasetNotFound`] when `name` holds no array, or any error
/// reading or decoding a chunk.
pub async fn read_array(store: &ZarrStore, name: &str) -> Result<ndarray::ArrayD<f64>> {
    lock(&store.metadata).remove(name);
    let meta = store.load_metadata(name).await?;
    let array_dir = dataset_path(&store.root, name)?;
    let grid = meta.grid();
    let mut data = ndarray::ArrayD::from_elem(meta.shape.clone(), meta.fill());

    for chunk_index in 0..grid.iter().product::<usize>() {
        let origin = unravel(chunk_index, &grid);
        let path = array_dir.join(meta.chunk_key(&origin));
        let stored = match tokio::fs::read(&path).await {
            Ok(stored) => stored,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        let values = decode_chunk(&meta, stored, &path)?;
        for (local_index, value) in values.into_iter().enumerate() {
            let global = meta.global_coords(&origin, &unravel(local_index, &meta.chunks));
            if let Some(cell) = data.get_mut(global.as_slice()) {
                *cell = value;
            }
        }
    }
    Ok(data)
}

/// C-order coordinates of `flat` within `extents`.
fn unravel(mut flat: usize, extents: &[usize]) -> Vec<usize> {
    let mut coords = vec![0; extents.len()];
    for (axis, &extent) in extents.iter().enumerate().rev() {
        coords[axis] = flat % extent;
        flat /= extent;
    }
    coords
}
