//! Collective access to the shared store
//!
//! [`StoreAccessor`] pairs a [`Store`] backend with the [`Coordinator`] of this
//! worker. Opening, validating and closing are collective calls: every worker must
//! make them with matching arguments, in the same order.

use crate::collective::Coordinator;
use crate::environment::Capability;
use crate::errors::{CoReduceError, Result};
use crate::store::{self, DatasetInfo, OpenMode, Store, StoreFormat};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Options shared by every worker opening a store
#[derive(Debug, Clone)]
pub struct OpenOptions {
    pub mode: OpenMode,
    pub format: StoreFormat,
    pub session: String,
    pub poll_interval: Duration,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            mode: OpenMode::default(),
            format: StoreFormat::default(),
            session: "default".to_string(),
            poll_interval: crate::collective::DEFAULT_POLL_INTERVAL,
        }
    }
}

/// An open store together with this worker's place in the collective protocol
pub struct StoreAccessor {
    store: Box<dyn Store>,
    coordinator: Coordinator,
    capability: Capability,
}

impl StoreAccessor {
    /// Open the store at `path`; a collective call when cooperating.
    ///
    /// # Errors
    ///
    /// - [`CoReduceError::CollectiveUnsupported`] when cooperating on a backend that
    ///   cannot be shared, identically on every worker
    /// - [`CoReduceError::CollectiveMismatch`] when workers opened with different arguments
    /// - any backend error
    pub async fn open(path: &Path, options: &OpenOptions, capability: Capability) -> Result<Self> {
        // Refuse before touching the file so that no worker creates or locks it.
        if capability.is_cooperating() && options.format.resolve(path) == StoreFormat::NetCDF {
            return Err(CoReduceError::CollectiveUnsupported { backend: "netcdf" });
        }
        let store = store::open_store(path, options.mode, options.format).await?;
        if capability.is_cooperating() && !store.supports_collective() {
            return Err(CoReduceError::CollectiveUnsupported {
                backend: store.backend(),
            });
        }

        let coordinator =
            Coordinator::connect(capability, path, &options.session, options.poll_interval).await?;
        let mut accessor = Self {
            store,
            coordinator,
            capability,
        };

        let fingerprint = format!(
            "{}|{}|{}",
            path.display(),
            accessor.store.backend(),
            options.mode.as_str()
        );
        if let Err(e) = accessor.coordinator.agree("open", &fingerprint).await {
            return Err(accessor.abort(e).await);
        }

        info!(
            store = %path.display(),
            backend = accessor.store.backend(),
            mode = options.mode.as_str(),
            worker = %capability,
            "store opened"
        );
        Ok(accessor)
    }

    #[must_use]
    pub fn store(&self) -> &dyn Store {
        self.store.as_ref()
    }

    pub fn store_mut(&mut self) -> &mut dyn Store {
        self.store.as_mut()
    }

    pub fn coordinator(&mut self) -> &mut Coordinator {
        &mut self.coordinator
    }

    #[must_use]
    pub const fn capability(&self) -> Capability {
        self.capability
    }

    /// Validate a dataset collectively.
    ///
    /// Every worker checks locally and the outcomes are agreed before anyone
    /// proceeds, so a failure is raised identically on every worker.
    ///
    /// # Errors
    ///
    /// [`CoReduceError::DatasetNotFound`], [`CoReduceError::NotADataset`],
    /// [`CoReduceError::RankMismatch`], or an agreement error.
    pub async fn validate_dataset(&mut self, name: &str, expected_rank: usize) -> Result<DatasetInfo> {
        let local = store::validate_dataset(self.store.as_ref(), name, expected_rank).await;
        self.coordinator
            .agree_outcome("validate", local, |info| {
                format!("{}:{:?}:{}", info.name, info.shape, info.dtype)
            })
            .await
    }

    /// Close the store; a collective barrier when cooperating.
    ///
    /// # Errors
    ///
    /// Any error flushing the store or running the final round.
    pub async fn close(mut self) -> Result<()> {
        let flushed = self.store.flush().await;
        self.coordinator.barrier("close").await?;
        self.coordinator.leave().await?;
        debug!(worker = %self.capability, "store closed");
        flushed
    }

    /// Best-effort close after an agreed failure; returns `error` for propagation.
    pub async fn abort(self, error: CoReduceError) -> CoReduceError {
        warn!(worker = %self.capability, error = %error, "aborting run");
        if let Err(close_error) = self.close().await {
            warn!(error = %close_error, "close after failure did not complete");
        }
        error
    }
}
