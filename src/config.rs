//! Run configuration
//!
//! A [`RunConfig`] carries everything a worker needs to take part in a run. The
//! CLI builds one from arguments and environment; library users can build one
//! directly.

use crate::collective::DEFAULT_POLL_INTERVAL;
use crate::statistics::StatOperation;
use crate::store::{OpenMode, StoreFormat};
use std::path::PathBuf;
use std::time::Duration;

/// Input dataset name used when none is given
pub const DEFAULT_INPUT: &str = "mydataset";

/// Output dataset name used when none is given
pub const DEFAULT_OUTPUT: &str = "result";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub store_path: PathBuf,
    pub input: String,
    pub output: String,
    pub reduction: StatOperation,
    pub format: StoreFormat,
    pub mode: OpenMode,
    pub poll_interval: Duration,
    /// Overrides the session detected from the launcher environment
    pub session: Option<String>,
}

impl RunConfig {
    pub fn new(
        store_path: impl Into<PathBuf>,
        input: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            store_path: store_path.into(),
            input: input.into(),
            output: output.into(),
            reduction: StatOperation::default(),
            format: StoreFormat::default(),
            mode: OpenMode::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            session: None,
        }
    }
}
