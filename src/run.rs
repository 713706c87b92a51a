//! Run entry point
//!
//! [`ReductionRun`] drives one worker through the whole protocol: detect the
//! environment, open the store, validate the input, reconcile the output name,
//! reduce the assigned units, commit the output and close the store. Every collective step is taken by every
//! worker in the same order, including after an agreed failure.

use crate::accessor::{OpenOptions, StoreAccessor};
use crate::commit::OutputCommitter;
use crate::config::RunConfig;
use crate::engine::ReductionEngine;
use crate::environment::{self, Capability};
use crate::errors::Result;
use crate::statistics::{Reducer, StatOperation};
use crate::store::{OpenMode, StoreFormat};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

/// Rank of the input dataset: units x sub-units x samples
pub const INPUT_RANK: usize = 3;

/// What one worker did during a successful run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub capability: Capability,
    pub job_list: Vec<usize>,
    pub output_shape: [usize; 2],
    pub reduction: String,
}

/// One worker's share of a distributed reduction
pub struct ReductionRun {
    store_path: PathBuf,
    input: String,
    output: String,
    reducer: Box<dyn Reducer>,
    capability: Option<Capability>,
    options: OpenOptions,
    session: Option<String>,
}

impl ReductionRun {
    /// Reduce `input` of the store at `store_path` into `output` with the mean.
    pub fn new(
        store_path: impl Into<PathBuf>,
        input: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self {
            store_path: store_path.into(),
            input: input.into(),
            output: output.into(),
            reducer: Box::new(StatOperation::Mean),
            capability: None,
            options: OpenOptions::default(),
            session: None,
        }
    }

    #[must_use]
    pub fn from_config(config: &RunConfig) -> Self {
        let mut run = Self::new(&config.store_path, &config.input, &config.output)
            .with_reducer(config.reduction)
            .with_mode(config.mode)
            .with_format(config.format)
            .with_poll_interval(config.poll_interval);
        run.session.clone_from(&config.session);
        run
    }

    /// Use another reduction than the mean.
    #[must_use]
    pub fn with_reducer(mut self, reducer: impl Reducer + 'static) -> Self {
        self.reducer = Box::new(reducer);
        self
    }

    /// Skip environment detection and act with the given capability.
    #[must_use]
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = Some(capability);
        self
    }

    #[must_use]
    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: OpenMode) -> Self {
        self.options.mode = mode;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: StoreFormat) -> Self {
        self.options.format = format;
        self
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.options.poll_interval = poll_interval;
        self
    }

    /// Run this worker's share of the reduction.
    ///
    /// # Errors
    ///
    /// Any error of the run; see [`ReductionRun::execute`].
    pub async fn run(&self) -> Result<()> {
        self.execute().await.map(|_| ())
    }

    /// Run this worker's share of the reduction and report what it did.
    ///
    /// # Errors
    ///
    /// - [`CoReduceError::Detection`](crate::CoReduceError::Detection) for a misconfigured launcher
    /// - [`CoReduceError::DatasetNotFound`](crate::CoReduceError::DatasetNotFound),
    ///   [`CoReduceError::NotADataset`](crate::CoReduceError::NotADataset) or
    ///   [`CoReduceError::RankMismatch`](crate::CoReduceError::RankMismatch) for a bad input
    /// - [`CoReduceError::OutputShapeConflict`](crate::CoReduceError::OutputShapeConflict)
    ///   when the output exists with another shape
    /// - store and protocol errors
    pub async fn execute(&self) -> Result<RunReport> {
        let capability = match self.capability {
            Some(capability) => capability,
            None => environment::detect()?,
        };
        let mut options = self.options.clone();
        options.session = self.session.clone().unwrap_or_else(environment::session_id);

        let mut accessor = StoreAccessor::open(&self.store_path, &options, capability).await?;
        match self.process(&mut accessor).await {
            Ok(report) => {
                accessor.close().await?;
                Ok(report)
            }
            Err(e) => Err(accessor.abort(e).await),
        }
    }

    async fn process(&self, accessor: &mut StoreAccessor) -> Result<RunReport> {
        let capability = accessor.capability();
        let arguments = format!("{}|{}|{}", self.input, self.output, self.reducer.name());
        accessor.coordinator().agree("run", &arguments).await?;

        let input = accessor.validate_dataset(&self.input, INPUT_RANK).await?;
        let job_list = capability.job_list(input.shape[0]);
        info!(
            worker = %capability,
            jobs = ?job_list,
            shape = ?input.shape,
            "job list assigned"
        );

        let committer = OutputCommitter::new(&self.output, &input, self.reducer.name());
        committer
            .reconcile(accessor, [input.shape[0], input.shape[1]])
            .await?;

        let computed = ReductionEngine::new(self.reducer.as_ref())
            .compute(accessor.store(), &input, &job_list)
            .await;
        let buffer = accessor
            .coordinator()
            .agree_outcome("compute", computed, |_| String::new())
            .await?;

        committer.commit(accessor, &buffer).await?;

        Ok(RunReport {
            capability,
            job_list,
            output_shape: buffer.shape(),
            reduction: self.reducer.name().to_string(),
        })
    }
}
