//! Defines command-line interface options using `clap` for the coreduce binary.

use crate::config::{RunConfig, DEFAULT_INPUT, DEFAULT_OUTPUT};
use crate::statistics::StatOperation;
use crate::store::{OpenMode, StoreFormat};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Reduce every (unit, sub-unit) lane of a 3-D dataset into a 2-D dataset,
/// optionally across several cooperating processes.
///
/// Launch several copies with mpirun, srun or COREDUCE_RANK/COREDUCE_WORLD_SIZE to
/// split the work.
#[derive(Parser, Debug)]
#[command(name = "coreduce", version, about)]
pub struct Args {
    /// Path to the Zarr directory or NetCDF file
    #[arg(short, long, env = "COREDUCE_STORE")]
    pub store: PathBuf,

    /// Name of the 3-D input dataset
    #[arg(short, long, env = "COREDUCE_INPUT", default_value = DEFAULT_INPUT)]
    pub input: String,

    /// Name of the 2-D output dataset
    #[arg(short, long, env = "COREDUCE_OUTPUT", default_value = DEFAULT_OUTPUT)]
    pub output: String,

    /// Statistic computed for every lane: mean, sum, min, max or std
    #[arg(short, long, env = "COREDUCE_REDUCTION", default_value = "mean")]
    pub reduction: StatOperation,

    /// Store backend: auto, zarr or netcdf
    #[arg(long, env = "COREDUCE_FORMAT", default_value = "auto")]
    pub format: StoreFormat,

    /// How to open the store: append, read-write or read-only
    #[arg(long, env = "COREDUCE_MODE", default_value = "append")]
    pub mode: OpenMode,

    /// Milliseconds between checks while waiting for other workers
    #[arg(long, env = "COREDUCE_POLL_INTERVAL_MS", default_value_t = 20)]
    pub poll_interval_ms: u64,

    /// Name of the collective session; defaults to the launcher's job id
    #[arg(long)]
    pub session: Option<String>,

    /// Enable verbose output.
    #[arg(short, long, default_value_t = false)]
    pub verbose: bool,
}

impl Args {
    #[must_use]
    pub fn into_config(self) -> RunConfig {
        RunConfig {
            store_path: self.store,
            input: self.input,
            output: self.output,
            reduction: self.reduction,
            format: self.format,
            mode: self.mode,
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            session: self.session,
        }
    }
}
