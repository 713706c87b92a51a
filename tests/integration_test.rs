mod common;

use common::{info, ramp, ramp_mean, read_output, seed};
use coreduce::environment::Capability;
use coreduce::store::{DType, OpenMode};
use coreduce::{CoReduceError, FnReducer, ReductionRun, StatOperation};
use ndarray::{Array2, Array3, ArrayView1};
use std::cell::Cell;
use std::rc::Rc;
use tempfile::tempdir;

fn standalone(root: &std::path::Path) -> ReductionRun {
    ReductionRun::new(root, "mydataset", "result").with_capability(Capability::Standalone)
}

#[tokio::test]
async fn test_mean_of_constant_dataset() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let root = temp_dir.path().join("testfile.zarr");
    seed(&root, "mydataset", Array3::ones((5, 4, 8)).into_dyn(), &[2, 4, 8], DType::F32).await;

    let report = standalone(&root).execute().await.expect("Run failed");
    assert_eq!(report.capability, Capability::Standalone);
    assert_eq!(report.job_list, vec![0, 1, 2, 3, 4]);
    assert_eq!(report.output_shape, [5, 4]);

    let output = read_output(&root, "result").await;
    assert_eq!(output, Array2::<f64>::ones((5, 4)));
}

#[tokio::test]
async fn test_every_cell_gets_its_own_lane() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let root = temp_dir.path().join("testfile.zarr");
    seed(&root, "mydataset", ramp(6, 5, 4).into_dyn(), &[4, 3, 3], DType::F32).await;

    standalone(&root).run().await.expect("Run failed");

    let output = read_output(&root, "result").await;
    assert_eq!(output, ramp_mean(6, 5, 4));
    // A sub-unit dependent value proves cells are not copied across a row.
    assert_ne!(output[[2, 0]], output[[2, 4]]);
}

#[tokio::test]
async fn test_output_metadata() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let root = temp_dir.path().join("testfile.zarr");
    seed(&root, "mydataset", ramp(3, 2, 4).into_dyn(), &[1, 2, 4], DType::F32).await;

    standalone(&root)
        .with_reducer(StatOperation::Max)
        .run()
        .await
        .expect("Run failed");

    let result = info(&root, "result").await.expect("Output missing");
    assert_eq!(result.shape, vec![3, 2]);
    assert_eq!(result.dtype, DType::F32);
    assert_eq!(result.dimensions, vec!["time", "lat"]);

    let attrs: serde_json::Value = serde_json::from_slice(
        &std::fs::read(root.join("result").join(".zattrs")).expect("Missing .zattrs"),
    )
    .expect("Invalid .zattrs");
    assert_eq!(attrs["operation"], "max");
    assert_eq!(attrs["source_dataset"], "mydataset");

    assert_eq!(read_output(&root, "result").await[[2, 1]], 213.0);
}

#[tokio::test]
async fn test_f64_input_keeps_its_type() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let root = temp_dir.path().join("testfile.zarr");
    let data = Array3::from_elem((2, 2, 3), 0.1_f64);
    seed(&root, "mydataset", data.into_dyn(), &[2, 2, 3], DType::F64).await;

    standalone(&root)
        .with_reducer(StatOperation::Sum)
        .run()
        .await
        .expect("Run failed");

    assert_eq!(info(&root, "result").await.unwrap().dtype, DType::F64);
    // An f32 round trip would be off by about 1e-8.
    assert!(read_output(&root, "result")
        .await
        .iter()
        .all(|v| (v - 0.3).abs() < 1e-12));
}

#[tokio::test]
async fn test_custom_reducer() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let root = temp_dir.path().join("testfile.zarr");
    seed(&root, "mydataset", ramp(2, 3, 5).into_dyn(), &[1, 3, 5], DType::F32).await;

    let range = FnReducer::new("range", |lane: ArrayView1<'_, f64>| {
        lane.fold(f64::NEG_INFINITY, |a, &b| a.max(b)) - lane.fold(f64::INFINITY, |a, &b| a.min(b))
    });
    standalone(&root).with_reducer(range).run().await.expect("Run failed");

    assert_eq!(read_output(&root, "result").await, Array2::from_elem((2, 3), 4.0));
}

#[tokio::test]
async fn test_nan_samples_propagate() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let root = temp_dir.path().join("testfile.zarr");
    let mut data = Array3::ones((2, 2, 3));
    data[[1, 0, 2]] = f64::NAN;
    seed(&root, "mydataset", data.into_dyn(), &[2, 2, 3], DType::F32).await;

    standalone(&root).run().await.expect("Run failed");

    let output = read_output(&root, "result").await;
    assert!(output[[1, 0]].is_nan());
    assert_eq!(output[[1, 1]], 1.0);
    assert_eq!(output[[0, 0]], 1.0);
}

#[tokio::test]
async fn test_missing_input_leaves_no_output() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let root = temp_dir.path().join("testfile.zarr");

    let err = standalone(&root).execute().await.unwrap_err();
    assert!(matches!(err, CoReduceError::DatasetNotFound { ref name, .. } if name == "mydataset"));
    assert!(info(&root, "result").await.is_none());
}

#[tokio::test]
async fn test_group_is_not_a_dataset() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let root = temp_dir.path().join("testfile.zarr");
    seed(&root, "grp/inner", ramp(2, 2, 2).into_dyn(), &[2, 2, 2], DType::F32).await;
    std::fs::write(root.join("grp").join(".zgroup"), br#"{"zarr_format": 2}"#).unwrap();

    let err = ReductionRun::new(&root, "grp", "result")
        .with_capability(Capability::Standalone)
        .execute()
        .await
        .unwrap_err();
    assert!(matches!(err, CoReduceError::NotADataset { ref name } if name == "grp"));

    // Nested datasets resolve through their group.
    ReductionRun::new(&root, "grp/inner", "result")
        .with_capability(Capability::Standalone)
        .run()
        .await
        .expect("Run on nested dataset failed");
    assert_eq!(read_output(&root, "result").await, ramp_mean(2, 2, 2));
}

#[tokio::test]
async fn test_rank_two_input_is_rejected() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let root = temp_dir.path().join("testfile.zarr");
    seed(&root, "mydataset", Array2::<f64>::ones((4, 4)).into_dyn(), &[4, 4], DType::F32).await;

    match standalone(&root).execute().await {
        Err(CoReduceError::RankMismatch {
            expected, actual, shape, ..
        }) => {
            assert_eq!((expected, actual), (3, 2));
            assert_eq!(shape, vec![4, 4]);
        }
        other => panic!("expected RankMismatch, got {other:?}"),
    }
    assert!(info(&root, "result").await.is_none());
}

#[tokio::test]
async fn test_conflicting_output_is_left_untouched() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let root = temp_dir.path().join("testfile.zarr");
    seed(&root, "mydataset", ramp(5, 4, 2).into_dyn(), &[5, 4, 2], DType::F32).await;
    let previous = Array2::from_elem((3, 3), 7.0);
    seed(&root, "result", previous.clone().into_dyn(), &[3, 3], DType::F32).await;

    match standalone(&root).execute().await {
        Err(CoReduceError::OutputShapeConflict {
            existing, expected, ..
        }) => {
            assert_eq!(existing, vec![3, 3]);
            assert_eq!(expected, vec![5, 4]);
        }
        other => panic!("expected OutputShapeConflict, got {other:?}"),
    }
    assert_eq!(read_output(&root, "result").await, previous);
}

#[tokio::test]
async fn test_conflict_is_found_before_any_lane_is_reduced() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let root = temp_dir.path().join("testfile.zarr");
    seed(&root, "mydataset", ramp(5, 4, 2).into_dyn(), &[5, 4, 2], DType::F32).await;
    seed(&root, "result", Array2::from_elem((2, 2), 1.0).into_dyn(), &[2, 2], DType::F32).await;

    let lanes = Rc::new(Cell::new(0_usize));
    let counted = Rc::clone(&lanes);
    let counting = FnReducer::new("counting", move |lane: ArrayView1<'_, f64>| {
        counted.set(counted.get() + 1);
        lane.sum()
    });

    let err = standalone(&root).with_reducer(counting).execute().await.unwrap_err();
    assert!(matches!(err, CoReduceError::OutputShapeConflict { .. }));
    assert_eq!(lanes.get(), 0);
}

#[tokio::test]
async fn test_matching_output_is_fully_replaced() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let root = temp_dir.path().join("testfile.zarr");
    seed(&root, "mydataset", ramp(5, 4, 2).into_dyn(), &[5, 4, 2], DType::F32).await;
    // Stale output with the right shape but a different chunk layout
    seed(&root, "result", Array2::from_elem((5, 4), -1.0).into_dyn(), &[5, 4], DType::F64).await;

    standalone(&root).run().await.expect("Run failed");

    assert_eq!(read_output(&root, "result").await, ramp_mean(5, 4, 2));
    assert_eq!(info(&root, "result").await.unwrap().dtype, DType::F32);
    assert!((0..5).all(|row| root.join("result").join(format!("{row}.0")).exists()));
}

#[test]
fn test_repeated_runs_are_identical() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let root = temp_dir.path().join("testfile.zarr");

    let (first, second) = tokio_test::block_on(async {
        seed(&root, "mydataset", ramp(4, 3, 6).into_dyn(), &[3, 2, 4], DType::F32).await;
        let run = standalone(&root).with_reducer(StatOperation::Std);
        run.run().await.expect("First run failed");
        let first = read_output(&root, "result").await;
        run.run().await.expect("Second run failed");
        (first, read_output(&root, "result").await)
    });

    assert_eq!(first, second);
    let expected = (35.0_f64 / 12.0).sqrt();
    assert!(first.iter().all(|v| (v - expected).abs() < 1e-6));
}

#[tokio::test]
async fn test_read_only_store_refuses_commit() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let root = temp_dir.path().join("testfile.zarr");
    seed(&root, "mydataset", ramp(2, 2, 2).into_dyn(), &[2, 2, 2], DType::F32).await;

    let err = standalone(&root)
        .with_mode(OpenMode::ReadOnly)
        .execute()
        .await
        .unwrap_err();
    assert!(matches!(err, CoReduceError::ReadOnlyStore(_)));
    assert!(info(&root, "result").await.is_none());
}

#[tokio::test]
async fn test_missing_store_in_read_write_mode() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let root = temp_dir.path().join("absent.zarr");

    let err = standalone(&root)
        .with_mode(OpenMode::ReadWrite)
        .execute()
        .await
        .unwrap_err();
    assert!(matches!(err, CoReduceError::StoreNotFound(_)));
    assert!(!root.exists());
}

#[tokio::test]
async fn test_empty_sample_axis() {
    let temp_dir = tempdir().expect("Failed to create temp dir");
    let root = temp_dir.path().join("testfile.zarr");
    seed(&root, "mydataset", Array3::<f64>::zeros((3, 2, 0)).into_dyn(), &[3, 2, 1], DType::F32).await;

    standalone(&root).run().await.expect("Mean run failed");
    assert!(read_output(&root, "result").await.iter().all(|v| v.is_nan()));

    standalone(&root)
        .with_reducer(StatOperation::Sum)
        .run()
        .await
        .expect("Sum run failed");
    assert_eq!(read_output(&root, "result").await, Array2::<f64>::zeros((3, 2)));
}
