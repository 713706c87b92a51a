//! Core statistical operations and traits
//!
//! This module defines the [`Reducer`] strategy applied to every sample lane and the
//! built-in [`StatOperation`] family.

use ndarray::ArrayView1;
use std::fmt;
use std::str::FromStr;

/// Scalar-producing function applied to one lane of samples
pub trait Reducer {
    /// Short name recorded alongside the output dataset
    fn name(&self) -> &str;

    /// Reduce a lane of samples to a single value
    fn reduce(&self, lane: ArrayView1<'_, f64>) -> f64;
}

/// Supported statistical operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatOperation {
    /// Arithmetic mean
    #[default]
    Mean,
    /// Sum of values
    Sum,
    /// Minimum value
    Min,
    /// Maximum value
    Max,
    /// Population standard deviation
    Std,
}

impl StatOperation {
    /// Get the string representation of the operation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mean => "mean",
            Self::Sum => "sum",
            Self::Min => "min",
            Self::Max => "max",
            Self::Std => "std",
        }
    }

    pub const ALL: [Self; 5] = [Self::Mean, Self::Sum, Self::Min, Self::Max, Self::Std];
}

impl fmt::Display for StatOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StatOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|op| op.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                format!("unknown reduction '{s}', expected one of: mean, sum, min, max, std")
            })
    }
}

impl Reducer for StatOperation {
    fn name(&self) -> &str {
        self.as_str()
    }

    fn reduce(&self, lane: ArrayView1<'_, f64>) -> f64 {
        match self {
            Self::Mean => mean(lane),
            Self::Sum => lane.sum(),
            Self::Min => extremum(lane, f64::min),
            Self::Max => extremum(lane, f64::max),
            Self::Std => std_dev(lane),
        }
    }
}

// NaN propagates through every reduction; f64::min/max alone would drop it.
fn extremum(lane: ArrayView1<'_, f64>, pick: fn(f64, f64) -> f64) -> f64 {
    let mut iter = lane.iter().copied();
    let Some(first) = iter.next() else {
        return f64::NAN;
    };
    iter.fold(first, |acc, x| {
        if acc.is_nan() || x.is_nan() {
            f64::NAN
        } else {
            pick(acc, x)
        }
    })
}

fn mean(lane: ArrayView1<'_, f64>) -> f64 {
    if lane.is_empty() {
        return f64::NAN;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = lane.len() as f64;
    lane.sum() / n
}

fn std_dev(lane: ArrayView1<'_, f64>) -> f64 {
    let centre = mean(lane);
    if centre.is_nan() {
        return f64::NAN;
    }
    #[allow(clippy::cast_precision_loss)]
    let n = lane.len() as f64;
    let variance = lane.iter().map(|x| (x - centre).powi(2)).sum::<f64>() / n;
    variance.sqrt()
}

/// A named closure usable as a [`Reducer`]
pub struct FnReducer<F> {
    name: String,
    func: F,
}

impl<F> FnReducer<F>
where
    F: Fn(ArrayView1<'_, f64>) -> f64,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Reducer for FnReducer<F>
where
    F: Fn(ArrayView1<'_, f64>) -> f64,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn reduce(&self, lane: ArrayView1<'_, f64>) -> f64 {
        (self.func)(lane)
    }
}

impl<F> fmt::Debug for FnReducer<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnReducer").field("name", &self.name).finish()
    }
}
