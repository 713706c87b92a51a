//! Per-lane statistical reductions
//!
//! The reduction engine is configured with any [`Reducer`]; [`StatOperation`] covers
//! the common statistics and [`FnReducer`] wraps a closure.

pub mod operations;

pub use operations::{FnReducer, Reducer, StatOperation};
