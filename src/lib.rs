//! coreduce: cooperative per-lane reductions over persisted arrays
//!
//! Reduces every `(unit, sub_unit, ..)` lane of a three-dimensional dataset to a
//! single value and writes the `(unit, sub_unit)` results back into the same store
//! as a two-dimensional dataset. The work can be split across several cooperating
//! processes launched by `mpirun`, `srun` or by hand.
//!
//! ## Key Features
//!
//! - **Cooperative runs**: units are striped across workers (`unit % world_size`), and
//!   every worker commits only its own rows
//! - **Collective store protocol**: open, validation, output reconcile and close are
//!   agreement rounds held inside the store, so workers never diverge on a failure
//! - **Pluggable reductions**: mean, sum, min, max and standard deviation, or any
//!   closure through [`FnReducer`]
//! - **Zarr & NetCDF support**: Zarr v2 directory stores for cooperative runs, NetCDF
//!   files for standalone ones
//!
//! ## Module Organization
//!
//! - [`environment`]: detection of the cooperative execution context
//! - [`partition`]: index-striped job lists
//! - [`store`]: the [`Store`] trait and its Zarr and NetCDF backends
//! - [`collective`]: agreement rounds and barriers held in the store
//! - [`accessor`]: collective open, validate and close
//! - [`engine`]: the reduction engine and its result buffer
//! - [`commit`]: output reconcile and write
//! - [`run`]: the [`ReductionRun`] entry point
//! - [`errors`]: centralized error handling
//!
//! ## Usage
//!
//! ```rust,no_run
//! use coreduce::prelude::*;
//!
//! # async fn demo() -> coreduce::Result<()> {
//! ReductionRun::new("testfile.zarr", "mydataset", "result")
//!     .with_reducer(StatOperation::Std)
//!     .run()
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod accessor;
pub mod cli;
pub mod collective;
pub mod commit;
pub mod config;
pub mod engine;
pub mod environment;
pub mod errors;
pub mod logging;
pub mod partition;
pub mod run;
pub mod statistics;
pub mod store;

mod utils;

pub use errors::{CoReduceError, Result};
pub use run::{ReductionRun, RunReport};
pub use statistics::{FnReducer, Reducer, StatOperation};
pub use store::Store;

/// Commonly used imports for convenience
pub mod prelude {
    pub use crate::config::RunConfig;
    pub use crate::environment::Capability;
    pub use crate::errors::{CoReduceError, Result};
    pub use crate::run::{ReductionRun, RunReport};
    pub use crate::statistics::{FnReducer, Reducer, StatOperation};
    pub use crate::store::{DatasetInfo, OpenMode, Store, StoreFormat};
}
