//! NetCDF file store
//!
//! Variables are datasets; dimensions and groups are entities that are not. NetCDF
//! cannot delete a variable, so recreating an output overwrites every cell with the
//! fill value instead. The format offers no safe concurrent writers here, so the
//! store refuses to take part in a cooperative run.

use super::{DType, DatasetInfo, DatasetSpec, OpenMode, Store};
use crate::errors::{CoReduceError, Result};
use async_trait::async_trait;
use chrono::Utc;
use ndarray::{s, Array1, Array2, Array3, ArrayView2};
use serde_json::Value as JsonValue;
use std::cell::RefCell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

enum Handle {
    Read(netcdf::File),
    Write(netcdf::FileMut),
}

/// Store backed by a single NetCDF file
pub struct NetcdfStore {
    path: PathBuf,
    mode: OpenMode,
    handle: Handle,
    /// Whole input variables, loaded on first lane access
    loaded: RefCell<HashMap<String, Array3<f64>>>,
}

impl NetcdfStore {
    /// Open or, in [`OpenMode::Append`], create the file at `path`.
    ///
    /// # Errors
    ///
    /// [`CoReduceError::StoreNotFound`] when the file is missing and `mode` does not
    /// create it, or any NetCDF error.
    pub fn open(path: &Path, mode: OpenMode) -> Result<Self> {
        let handle = match (mode, path.exists()) {
            (OpenMode::ReadOnly, true) => Handle::Read(netcdf::open(path)?),
            (OpenMode::ReadWrite | OpenMode::Append, true) => Handle::Write(netcdf::append(path)?),
            (OpenMode::Append, false) => {
                debug!(store = %path.display(), "creating NetCDF file");
                Handle::Write(netcdf::create(path)?)
            }
            (_, false) => return Err(CoReduceError::StoreNotFound(path.display().to_string())),
        };

        Ok(Self {
            path: path.to_path_buf(),
            mode,
            handle,
            loaded: RefCell::new(HashMap::new()),
        })
    }

    fn file(&self) -> &netcdf::File {
        match &self.handle {
            Handle::Read(file) => file,
            Handle::Write(file) => &**file,
        }
    }

    fn file_mut(&mut self) -> Result<&mut netcdf::FileMut> {
        match &mut self.handle {
            Handle::Write(file) => Ok(file),
            Handle::Read(_) => Err(CoReduceError::ReadOnlyStore(self.path.display().to_string())),
        }
    }

    fn not_found(&self, name: &str) -> CoReduceError {
        CoReduceError::DatasetNotFound {
            name: name.to_string(),
            store: self.path.display().to_string(),
        }
    }
}

/// Element type of a variable, from its NetCDF type name.
fn variable_dtype(var: &netcdf::Variable<'_>) -> DType {
    let data_type = format!("{:?}", var.vartype()).to_lowercase();
    if data_type.contains("f64") || data_type.contains("double") {
        DType::F64
    } else if data_type.contains("f32") || data_type.contains("float") {
        DType::F32
    } else {
        DType::Other(data_type)
    }
}

#[async_trait(?Send)]
impl Store for NetcdfStore {
    fn backend(&self) -> &'static str {
        "netcdf"
    }

    fn location(&self) -> &Path {
        &self.path
    }

    fn mode(&self) -> OpenMode {
        self.mode
    }

    fn supports_collective(&self) -> bool {
        false
    }

    async fn dataset_info(&self, name: &str) -> Result<Option<DatasetInfo>> {
        let file = self.file();
        if let Some(var) = file.variable(name) {
            let dims = var.dimensions();
            return Ok(Some(DatasetInfo {
                name: name.to_string(),
                shape: dims.iter().map(netcdf::Dimension::len).collect(),
                dtype: variable_dtype(&var),
                dimensions: dims.iter().map(|d| d.name().to_string()).collect(),
            }));
        }

        if file.dimension(name).is_some() || matches!(file.group(name), Ok(Some(_))) {
            return Err(CoReduceError::NotADataset {
                name: name.to_string(),
            });
        }
        Ok(None)
    }

    async fn read_lane(&self, name: &str, unit: usize, sub_unit: usize) -> Result<Array1<f64>> {
        if !self.loaded.borrow().contains_key(name) {
            let var = self.file().variable(name).ok_or_else(|| self.not_found(name))?;
            let shape: Vec<usize> = var
                .dimensions()
                .iter()
                .map(netcdf::Dimension::len)
                .collect();
            if shape.len() != 3 {
                return Err(CoReduceError::RankMismatch {
                    name: name.to_string(),
                    expected: 3,
                    actual: shape.len(),
                    shape,
                });
            }

            let dtype = variable_dtype(&var);
            debug!(dataset = %name, ?shape, %dtype, "loading NetCDF variable");
            let values: Vec<f64> = match dtype {
                DType::F64 => var.get_values::<f64, _>(..)?,
                DType::F32 => var
                    .get_values::<f32, _>(..)?
                    .into_iter()
                    .map(f64::from)
                    .collect(),
                DType::Other(raw) => {
                    return Err(CoReduceError::UnsupportedDataType {
                        name: name.to_string(),
                        dtype: raw,
                    })
                }
            };
            let data = Array3::from_shape_vec((shape[0], shape[1], shape[2]), values)?;
            self.loaded.borrow_mut().insert(name.to_string(), data);
        }

        let loaded = self.loaded.borrow();
        let data = loaded.get(name).ok_or_else(|| self.not_found(name))?;
        Ok(data.slice(s![unit, sub_unit, ..]).to_owned())
    }

    async fn recreate_dataset(&mut self, spec: &DatasetSpec) -> Result<()> {
        let (units, sub_units) = match spec.shape.as_slice() {
            &[units, sub_units] => (units, sub_units),
            other => {
                return Err(CoReduceError::RankMismatch {
                    name: spec.name.clone(),
                    expected: 2,
                    actual: other.len(),
                    shape: other.to_vec(),
                })
            }
        };
        let not_found = self.not_found(&spec.name);
        let file = self.file_mut()?;

        if file.variable(&spec.name).is_none() {
            let dims: Vec<&str> = spec.dimensions.iter().map(String::as_str).collect();
            if spec.dtype == DType::F64 {
                file.add_variable::<f64>(&spec.name, &dims)?;
            } else {
                file.add_variable::<f32>(&spec.name, &dims)?;
            }
        } else {
            debug!(dataset = %spec.name, "overwriting existing NetCDF variable");
        }

        {
            let mut var = file.variable_mut(&spec.name).ok_or(not_found)?;
            // A replaced variable keeps the type it was created with.
            if variable_dtype(&var) == DType::F64 {
                let blank = Array2::<f64>::from_elem((units, sub_units), f64::NAN);
                var.put(blank.view(), ..)?;
            } else {
                let blank = Array2::<f32>::from_elem((units, sub_units), f32::NAN);
                var.put(blank.view(), ..)?;
            }

            for (key, value) in &spec.attributes {
                match value {
                    JsonValue::String(text) => {
                        var.put_attribute(key, text.as_str())?;
                    }
                    other => warn!(attribute = %key, value = %other, "skipped non-string attribute"),
                }
            }
        }

        file.add_attribute(
            "history",
            format!("Written by coreduce on {}", Utc::now().to_rfc3339()),
        )?;
        Ok(())
    }

    async fn write_rows(
        &mut self,
        name: &str,
        rows: &[usize],
        values: ArrayView2<'_, f64>,
    ) -> Result<()> {
        let mut block = Array2::<f64>::from_elem(values.raw_dim(), f64::NAN);
        for &row in rows {
            block.row_mut(row).assign(&values.row(row));
        }

        let not_found = self.not_found(name);
        let file = self.file_mut()?;
        let mut var = file.variable_mut(name).ok_or(not_found)?;
        if variable_dtype(&var) == DType::F64 {
            var.put(block.view(), ..)?;
        } else {
            #[allow(clippy::cast_possible_truncation)]
            let narrowed = block.mapv(|v| v as f32);
            var.put(narrowed.view(), ..)?;
        }
        debug!(dataset = %name, rows = rows.len(), "wrote NetCDF rows");
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.loaded.borrow_mut().clear();
        Ok(())
    }
}
