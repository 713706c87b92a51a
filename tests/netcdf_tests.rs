mod common;

use common::{ramp, ramp_mean};
use coreduce::environment::Capability;
use coreduce::{CoReduceError, ReductionRun, StatOperation};
use futures::future::join_all;
use ndarray::{Array2, Array3};
use netcdf::{create, open, AttributeValue};
use std::path::Path;
use tempfile::tempdir;

/// Write a (3, 2, 4) ramp as `mydataset` with dimensions time, lat and sample.
fn create_input(path: &Path) {
    let mut file = create(path).expect("Failed to create NetCDF file");
    file.add_dimension("time", 3)
        .expect("Failed to add dimension time");
    file.add_dimension("lat", 2)
        .expect("Failed to add dimension lat");
    file.add_dimension("sample", 4)
        .expect("Failed to add dimension sample");

    let mut var = file
        .add_variable::<f32>("mydataset", &["time", "lat", "sample"])
        .expect("Failed to add variable");
    let data = ramp(3, 2, 4).mapv(|v| v as f32);
    var.put(data.view(), ..).expect("Failed to write data");
}

/// Create a file with (2, 2, 3) dimensions time, lat and sample.
fn create_small_file(path: &Path) -> netcdf::FileMut {
    let mut file = create(path).expect("Failed to create NetCDF file");
    file.add_dimension("time", 2)
        .expect("Failed to add dimension time");
    file.add_dimension("lat", 2)
        .expect("Failed to add dimension lat");
    file.add_dimension("sample", 3)
        .expect("Failed to add dimension sample");
    file
}

fn read_result(path: &Path, name: &str) -> Array2<f64> {
    let file = open(path).expect("Failed to open NetCDF file");
    let var = file.variable(name).expect("Variable not found");
    let shape: Vec<usize> = var.dimensions().iter().map(|d| d.len()).collect();
    let values: Vec<f32> = var.get_values::<f32, _>(..).expect("Failed to read values");
    Array2::from_shape_vec((shape[0], shape[1]), values)
        .expect("Result is not 2-D")
        .mapv(f64::from)
}

fn standalone(path: &Path, input: &str) -> ReductionRun {
    ReductionRun::new(path, input, "result").with_capability(Capability::Standalone)
}

#[tokio::test]
async fn test_standalone_netcdf_run() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let path = temp_dir.path().join("test_data.nc");
    create_input(&path);

    let report = standalone(&path, "mydataset").execute().await.expect("Run failed");
    assert_eq!(report.output_shape, [3, 2]);
    assert_eq!(read_result(&path, "result"), ramp_mean(3, 2, 4));

    let file = open(&path).expect("Failed to open NetCDF file");
    let var = file.variable("result").expect("Variable not found");
    let dims: Vec<String> = var.dimensions().iter().map(|d| d.name()).collect();
    assert_eq!(dims, vec!["time", "lat"]);
    let operation = var
        .attribute("operation")
        .expect("Missing operation attribute")
        .value()
        .expect("Unreadable attribute");
    assert!(matches!(operation, AttributeValue::Str(ref op) if op == "mean"));
}

#[tokio::test]
async fn test_rerun_overwrites_existing_variable() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let path = temp_dir.path().join("test_data.nc");
    create_input(&path);

    standalone(&path, "mydataset").run().await.expect("First run failed");
    standalone(&path, "mydataset")
        .with_reducer(StatOperation::Min)
        .run()
        .await
        .expect("Second run failed");

    let expected = Array2::from_shape_fn((3, 2), |(i, j)| (i * 100 + j * 10) as f64);
    assert_eq!(read_result(&path, "result"), expected);
}

#[tokio::test]
async fn test_dimension_is_not_a_dataset() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let path = temp_dir.path().join("test_data.nc");
    create_input(&path);

    let err = standalone(&path, "lat").execute().await.unwrap_err();
    assert!(matches!(err, CoReduceError::NotADataset { ref name } if name == "lat"));

    let err = standalone(&path, "absent").execute().await.unwrap_err();
    assert!(matches!(err, CoReduceError::DatasetNotFound { .. }));
}

#[tokio::test]
async fn test_integer_variable_is_unsupported() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let path = temp_dir.path().join("counts.nc");
    {
        let mut file = create_small_file(&path);
        let mut var = file
            .add_variable::<i32>("mydataset", &["time", "lat", "sample"])
            .expect("Failed to add variable");
        let data = Array3::from_shape_fn((2, 2, 3), |(i, j, k)| (i * 100 + j * 10 + k) as i32);
        var.put(data.view(), ..).expect("Failed to write data");
    }

    let err = standalone(&path, "mydataset").execute().await.unwrap_err();
    assert!(matches!(err, CoReduceError::UnsupportedDataType { ref name, .. } if name == "mydataset"));

    let file = open(&path).expect("Failed to open NetCDF file");
    assert!(file.variable("result").is_none());
}

#[tokio::test]
async fn test_double_variable_keeps_precision() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let path = temp_dir.path().join("doubles.nc");
    // Offsets below f32 resolution at this magnitude
    let base = 16_777_216.0_f64;
    {
        let mut file = create_small_file(&path);
        let mut var = file
            .add_variable::<f64>("mydataset", &["time", "lat", "sample"])
            .expect("Failed to add variable");
        let data = Array3::from_shape_fn((2, 2, 3), |(i, j, k)| {
            base + (i * 4 + j * 2) as f64 + k as f64 * 0.25
        });
        var.put(data.view(), ..).expect("Failed to write data");
    }

    standalone(&path, "mydataset").run().await.expect("Run failed");

    let file = open(&path).expect("Failed to open NetCDF file");
    let var = file.variable("result").expect("Variable not found");
    assert!(format!("{:?}", var.vartype()).to_lowercase().contains("f64"));
    let values: Vec<f64> = var.get_values::<f64, _>(..).expect("Failed to read values");
    let expected: Vec<f64> = (0..2)
        .flat_map(|i| (0..2).map(move |j| base + (i * 4 + j * 2) as f64 + 0.25))
        .collect();
    for (value, expected) in values.iter().zip(&expected) {
        assert!((value - expected).abs() < 1e-6, "{value} != {expected}");
    }
}

#[tokio::test]
async fn test_conflicting_netcdf_output() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let path = temp_dir.path().join("test_data.nc");
    create_input(&path);
    {
        let mut file = netcdf::append(&path).expect("Failed to reopen NetCDF file");
        let mut var = file
            .add_variable::<f32>("result", &["lat", "sample"])
            .expect("Failed to add variable");
        var.put(Array2::<f32>::from_elem((2, 4), 9.0).view(), ..)
            .expect("Failed to write data");
    }

    let err = standalone(&path, "mydataset").execute().await.unwrap_err();
    assert!(matches!(err, CoReduceError::OutputShapeConflict { .. }));
    assert_eq!(read_result(&path, "result"), Array2::from_elem((2, 4), 9.0));
}

#[tokio::test]
async fn test_netcdf_refuses_cooperating_workers() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let path = temp_dir.path().join("shared.nc");

    let runs: Vec<ReductionRun> = (0..2)
        .map(|rank| {
            ReductionRun::new(&path, "mydataset", "result")
                .with_capability(Capability::Cooperating {
                    rank,
                    world_size: 2,
                })
                .with_session("nc")
        })
        .collect();
    for result in join_all(runs.iter().map(ReductionRun::execute)).await {
        assert!(matches!(
            result,
            Err(CoReduceError::CollectiveUnsupported { backend: "netcdf" })
        ));
    }
    assert!(!path.exists());
}
