//! Index-striped job partitioning
//!
//! Unit `i` belongs to worker `i % world_size`. Striping keeps per-worker counts
//! even when expensive units cluster together, at the cost of locality.

/// Unit indices assigned to `rank` out of `world_size` workers.
///
/// A `world_size` of zero is treated as one.
#[must_use]
pub fn job_list(total_units: usize, world_size: usize, rank: usize) -> Vec<usize> {
    let stride = world_size.max(1);
    (rank..total_units).step_by(stride).collect()
}

/// Job lists of every worker, indexed by rank.
#[must_use]
pub fn partition(total_units: usize, world_size: usize) -> Vec<Vec<usize>> {
    (0..world_size.max(1))
        .map(|rank| job_list(total_units, world_size, rank))
        .collect()
}
