//! Reduction engine
//!
//! Walks the lanes `(unit, sub_unit, ..)` of the assigned units and stores one
//! reduced value per lane in a [`ResultBuffer`].

use crate::errors::Result;
use crate::statistics::Reducer;
use crate::store::{DatasetInfo, Store};
use futures::{pin_mut, Stream, TryStreamExt};
use ndarray::{Array1, Array2};
use tracing::{debug, info};

/// One lane of samples together with its position
pub type Lane = (usize, usize, Array1<f64>);

/// Reduced values of one worker, shaped like the full output
#[derive(Debug, Clone)]
pub struct ResultBuffer {
    values: Array2<f64>,
    rows: Vec<usize>,
}

impl ResultBuffer {
    /// Buffer of `units` x `sub_units` cells, NaN until computed.
    #[must_use]
    pub fn new(units: usize, sub_units: usize, rows: Vec<usize>) -> Self {
        Self {
            values: Array2::from_elem((units, sub_units), f64::NAN),
            rows,
        }
    }

    #[must_use]
    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    /// Rows computed by this worker
    #[must_use]
    pub fn rows(&self) -> &[usize] {
        &self.rows
    }

    #[must_use]
    pub fn shape(&self) -> [usize; 2] {
        let (units, sub_units) = self.values.dim();
        [units, sub_units]
    }

    fn set(&mut self, unit: usize, sub_unit: usize, value: f64) {
        self.values[[unit, sub_unit]] = value;
    }
}

/// Stream every lane of the listed units, in job-list order.
pub fn lanes<'a>(
    store: &'a dyn Store,
    dataset: &'a str,
    units: &'a [usize],
    sub_units: usize,
) -> impl Stream<Item = Result<Lane>> + 'a {
    async_stream::try_stream! {
        for &unit in units {
            debug!(unit, "reducing unit");
            for sub_unit in 0..sub_units {
                let samples = store.read_lane(dataset, unit, sub_unit).await?;
                yield (unit, sub_unit, samples);
            }
        }
    }
}

/// Applies a [`Reducer`] to every lane of the assigned units
pub struct ReductionEngine<'r> {
    reducer: &'r dyn Reducer,
}

impl<'r> ReductionEngine<'r> {
    #[must_use]
    pub fn new(reducer: &'r dyn Reducer) -> Self {
        Self { reducer }
    }

    /// Reduce the lanes of `units` in `input`.
    ///
    /// Each `(unit, sub_unit)` cell is written as soon as its lane is reduced.
    ///
    /// # Errors
    ///
    /// Any error reading a lane from the store.
    pub async fn compute(
        &self,
        store: &dyn Store,
        input: &DatasetInfo,
        units: &[usize],
    ) -> Result<ResultBuffer> {
        let (total_units, sub_units) = (input.shape[0], input.shape[1]);
        let mut buffer = ResultBuffer::new(total_units, sub_units, units.to_vec());

        info!(
            dataset = %input.name,
            reduction = self.reducer.name(),
            units = units.len(),
            sub_units,
            "computing"
        );

        let stream = lanes(store, &input.name, units, sub_units);
        pin_mut!(stream);
        while let Some((unit, sub_unit, samples)) = stream.try_next().await? {
            buffer.set(unit, sub_unit, self.reducer.reduce(samples.view()));
        }

        Ok(buffer)
    }
}
