#![allow(dead_code)]

use coreduce::store::zarr::{read_array, write_array, ZarrStore};
use coreduce::store::{DType, DatasetInfo, OpenMode, Store};
use ndarray::{Array2, Array3, ArrayD, Ix2};
use std::path::Path;
use std::time::Duration;

pub const POLL: Duration = Duration::from_millis(1);

/// Values that differ along every axis, so misplaced cells are caught.
pub fn ramp(units: usize, sub_units: usize, samples: usize) -> Array3<f64> {
    Array3::from_shape_fn((units, sub_units, samples), |(i, j, k)| {
        (i * 100 + j * 10 + k) as f64
    })
}

/// Mean of every lane of [`ramp`].
pub fn ramp_mean(units: usize, sub_units: usize, samples: usize) -> Array2<f64> {
    let offset = (samples as f64 - 1.0) / 2.0;
    Array2::from_shape_fn((units, sub_units), |(i, j)| {
        (i * 100 + j * 10) as f64 + offset
    })
}

pub async fn seed(root: &Path, name: &str, data: ArrayD<f64>, chunks: &[usize], dtype: DType) {
    let store = ZarrStore::open(root, OpenMode::Append)
        .await
        .expect("Failed to open zarr store");
    let dimensions: Vec<String> = ["time", "lat", "sample", "extra"]
        .iter()
        .take(data.ndim())
        .map(|d| d.to_string())
        .collect();
    write_array(&store, name, &data, chunks, &dtype, Some(&dimensions))
        .await
        .expect("Failed to seed dataset");
}

pub async fn read_output(root: &Path, name: &str) -> Array2<f64> {
    let store = ZarrStore::open(root, OpenMode::ReadOnly)
        .await
        .expect("Failed to open zarr store");
    read_array(&store, name)
        .await
        .expect("Failed to read output")
        .into_dimensionality::<Ix2>()
        .expect("Output is not 2-D")
}

pub async fn info(root: &Path, name: &str) -> Option<DatasetInfo> {
    let store = ZarrStore::open(root, OpenMode::ReadOnly)
        .await
        .expect("Failed to open zarr store");
    store.dataset_info(name).await.expect("Failed to describe dataset")
}
