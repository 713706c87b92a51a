//! Creates a sample Zarr store for trying out coreduce.
//!
//! The store holds a deterministic (10, 10, 10) `f4` dataset named `mydataset`;
//! reduce it with `coreduce --store testfile.zarr` or under `mpirun -n 3`.

use coreduce::store::zarr::{write_array, ZarrStore};
use coreduce::store::{DType, OpenMode};
use ndarray::Array3;
use std::path::Path;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let output_path = Path::new("testfile.zarr");

    println!("🔨 Creating test Zarr store: {}", output_path.display());

    // Remove existing store if it exists
    if output_path.exists() {
        std::fs::remove_dir_all(output_path)?;
    }

    let store = ZarrStore::open(output_path, OpenMode::Append).await?;

    // Linear congruential sequence in [0, 1), identical on every run
    let mut state: u32 = 12345;
    let data = Array3::from_shape_simple_fn((10, 10, 10), || {
        state = state.wrapping_mul(1_103_515_245).wrapping_add(12345);
        f64::from(state >> 8) / f64::from(1u32 << 24)
    });

    let dimensions = ["time", "lat", "lon"].map(String::from);
    write_array(
        &store,
        "mydataset",
        &data.into_dyn(),
        &[5, 10, 10],
        &DType::F32,
        Some(&dimensions),
    )
    .await?;

    println!("✅ Wrote mydataset (10 x 10 x 10, f4)");
    println!("💡 Try: cargo run -- --store testfile.zarr --reduction std");
    Ok(())
}
