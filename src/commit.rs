//! Output committer
//!
//! Reconciles the output name with any existing dataset before anything is
//! computed, then recreates the output and writes this worker's rows. Both steps
//! are collective: every worker agrees on the decision, the leader alone
//! recreates the dataset, and nobody writes rows before it exists.

use crate::accessor::StoreAccessor;
use crate::engine::ResultBuffer;
use crate::errors::{CoReduceError, Result};
use crate::store::{DatasetInfo, DatasetSpec, Store};
use chrono::Utc;
use serde_json::{json, Map};
use tracing::{debug, info};

/// What to do with the output name before writing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconcile {
    /// No dataset of that name exists yet
    Create,
    /// A dataset of the same shape exists and will be replaced
    Replace,
}

impl Reconcile {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Replace => "replace",
        }
    }
}

/// Decide how to treat an existing output dataset of `name`.
///
/// # Errors
///
/// [`CoReduceError::OutputShapeConflict`] when a dataset of another shape exists,
/// [`CoReduceError::NotADataset`] when the name is taken by a non-array, or
/// [`CoReduceError::ReadOnlyStore`].
pub async fn reconcile(store: &dyn Store, name: &str, expected: &[usize]) -> Result<Reconcile> {
    if !store.mode().is_writable() {
        return Err(CoReduceError::ReadOnlyStore(
            store.location().display().to_string(),
        ));
    }
    match store.dataset_info(name).await? {
        None => Ok(Reconcile::Create),
        Some(existing) if existing.shape == expected => Ok(Reconcile::Replace),
        Some(existing) => Err(CoReduceError::OutputShapeConflict {
            name: name.to_string(),
            existing: existing.shape,
            expected: expected.to_vec(),
        }),
    }
}

/// Writes a [`ResultBuffer`] into the store as a rank-2 dataset
pub struct OutputCommitter<'a> {
    output: &'a str,
    source: &'a DatasetInfo,
    reduction: &'a str,
}

impl<'a> OutputCommitter<'a> {
    #[must_use]
    pub fn new(output: &'a str, source: &'a DatasetInfo, reduction: &'a str) -> Self {
        Self {
            output,
            source,
            reduction,
        }
    }

    fn spec(&self, shape: [usize; 2]) -> DatasetSpec {
        let mut attributes = Map::new();
        attributes.insert("operation".to_string(), json!(self.reduction));
        attributes.insert("source_dataset".to_string(), json!(self.source.name));
        attributes.insert(
            "history".to_string(),
            json!(format!("Written by coreduce on {}", Utc::now().to_rfc3339())),
        );

        DatasetSpec {
            name: self.output.to_string(),
            shape: shape.to_vec(),
            dtype: self.source.dtype.clone(),
            dimensions: self.source.dimensions.iter().take(2).cloned().collect(),
            attributes,
        }
    }

    /// Agree on how to treat an existing output of `shape`.
    ///
    /// # Errors
    ///
    /// The agreed reconcile error; see [`reconcile`].
    pub async fn reconcile(
        &self,
        accessor: &mut StoreAccessor,
        shape: [usize; 2],
    ) -> Result<Reconcile> {
        let decision = reconcile(accessor.store(), self.output, &shape).await;
        let decision = accessor
            .coordinator()
            .agree_outcome("reconcile", decision, |d| d.as_str().to_string())
            .await?;
        debug!(dataset = %self.output, decision = decision.as_str(), "output reconciled");
        Ok(decision)
    }

    /// Recreate the reconciled output and write this worker's rows.
    ///
    /// Closing the store is left to the caller, so that a failure here can still be
    /// followed by a collective close.
    ///
    /// # Errors
    ///
    /// Any error recreating or writing the dataset.
    pub async fn commit(&self, accessor: &mut StoreAccessor, buffer: &ResultBuffer) -> Result<()> {
        let shape = buffer.shape();

        let created = if accessor.coordinator().is_leader() {
            accessor.store_mut().recreate_dataset(&self.spec(shape)).await
        } else {
            Ok(())
        };
        accessor
            .coordinator()
            .agree_outcome("created", created, |()| String::new())
            .await?;

        let written = accessor
            .store_mut()
            .write_rows(self.output, buffer.rows(), buffer.values().view())
            .await;
        accessor
            .coordinator()
            .agree_outcome("committed", written, |()| String::new())
            .await?;

        info!(
            dataset = %self.output,
            rows = buffer.rows().len(),
            shape = ?shape,
            "results committed"
        );
        Ok(())
    }
}
