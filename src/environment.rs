//! Detection of the cooperative execution context
//!
//! A worker learns whether it is one of several cooperating processes from the
//! environment its launcher sets up. Absence of every known convention is the
//! normal standalone path; a convention that is present but inconsistent is a
//! [`DetectionError`].

use std::fmt;
use thiserror::Error;

/// How the current process participates in a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Single implicit worker owning every unit
    Standalone,
    /// One of `world_size` workers, identified by `rank`
    Cooperating { rank: usize, world_size: usize },
}

impl Capability {
    /// Number of workers taking part in the run.
    #[must_use]
    pub const fn world_size(self) -> usize {
        match self {
            Self::Standalone => 1,
            Self::Cooperating { world_size, .. } => world_size,
        }
    }

    /// Rank of this worker, if cooperating.
    #[must_use]
    pub const fn rank(self) -> Option<usize> {
        match self {
            Self::Standalone => None,
            Self::Cooperating { rank, .. } => Some(rank),
        }
    }

    #[must_use]
    pub const fn is_cooperating(self) -> bool {
        matches!(self, Self::Cooperating { .. })
    }

    /// Unit indices this worker is responsible for.
    #[must_use]
    pub fn job_list(self, total_units: usize) -> Vec<usize> {
        match self {
            Self::Standalone => (0..total_units).collect(),
            Self::Cooperating { rank, world_size } => {
                crate::partition::job_list(total_units, world_size, rank)
            }
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Standalone => write!(f, "standalone"),
            Self::Cooperating { rank, world_size } => {
                write!(f, "rank {rank} of {world_size}")
            }
        }
    }
}

/// A launcher convention: the variable holding the rank and the one holding the size.
#[derive(Debug, Clone, Copy)]
pub struct Launcher {
    pub name: &'static str,
    pub rank_var: &'static str,
    pub size_var: &'static str,
    /// The size variable only exists inside a launched step. Without it the
    /// rank variable is inherited from an enclosing allocation and is ignored.
    pub step_scoped: bool,
}

/// Conventions probed in order; the first whose rank variable is set wins.
pub const LAUNCHERS: &[Launcher] = &[
    Launcher {
        name: "coreduce",
        rank_var: "COREDUCE_RANK",
        size_var: "COREDUCE_WORLD_SIZE",
        step_scoped: false,
    },
    Launcher {
        name: "Open MPI",
        rank_var: "OMPI_COMM_WORLD_RANK",
        size_var: "OMPI_COMM_WORLD_SIZE",
        step_scoped: false,
    },
    Launcher {
        name: "PMI",
        rank_var: "PMI_RANK",
        size_var: "PMI_SIZE",
        step_scoped: false,
    },
    Launcher {
        name: "Slurm",
        rank_var: "SLURM_PROCID",
        // SLURM_NTASKS describes the allocation; a batch script sees it too.
        size_var: "SLURM_STEP_NUM_TASKS",
        step_scoped: true,
    },
];

/// Ways a present cooperative context can be inconsistent
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetectionError {
    #[error("{launcher}: {rank_var} is set but {size_var} is not")]
    MissingWorldSize {
        launcher: &'static str,
        rank_var: &'static str,
        size_var: &'static str,
    },

    #[error("{var}={value:?} is not a non-negative integer")]
    Unparsable { var: &'static str, value: String },

    #[error("{launcher}: world size is zero")]
    ZeroWorldSize { launcher: &'static str },

    #[error("{launcher}: rank {rank} is outside world size {world_size}")]
    RankOutOfRange {
        launcher: &'static str,
        rank: usize,
        world_size: usize,
    },
}

/// Detect the capability of the current process from its environment.
///
/// # Errors
///
/// Returns a [`DetectionError`] when a launcher convention is present but inconsistent.
pub fn detect() -> Result<Capability, DetectionError> {
    detect_with(|key| std::env::var(key).ok())
}

/// Detect the capability using an arbitrary variable lookup.
///
/// # Errors
///
/// See [`detect`].
pub fn detect_with<F>(lookup: F) -> Result<Capability, DetectionError>
where
    F: Fn(&str) -> Option<String>,
{
    for launcher in LAUNCHERS {
        let Some(raw_rank) = lookup(launcher.rank_var) else {
            continue;
        };
        let raw_size = match lookup(launcher.size_var) {
            Some(raw_size) => raw_size,
            None if launcher.step_scoped => continue,
            None => {
                return Err(DetectionError::MissingWorldSize {
                    launcher: launcher.name,
                    rank_var: launcher.rank_var,
                    size_var: launcher.size_var,
                })
            }
        };

        let rank = parse_count(launcher.rank_var, &raw_rank)?;
        let world_size = parse_count(launcher.size_var, &raw_size)?;

        if world_size == 0 {
            return Err(DetectionError::ZeroWorldSize {
                launcher: launcher.name,
            });
        }
        if rank >= world_size {
            return Err(DetectionError::RankOutOfRange {
                launcher: launcher.name,
                rank,
                world_size,
            });
        }

        // A single participant gains nothing from the collective protocol.
        if world_size == 1 {
            return Ok(Capability::Standalone);
        }
        return Ok(Capability::Cooperating { rank, world_size });
    }

    Ok(Capability::Standalone)
}

fn parse_count(var: &'static str, value: &str) -> Result<usize, DetectionError> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| DetectionError::Unparsable {
            var,
            value: value.to_string(),
        })
}

/// Identifier shared by every worker of one launch.
///
/// Used to name the store-side directory of collective rounds.
#[must_use]
pub fn session_id() -> String {
    session_id_with(|key| std::env::var(key).ok())
}

/// [`session_id`] with an arbitrary variable lookup.
pub fn session_id_with<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup("COREDUCE_SESSION")
        .or_else(|| {
            lookup("SLURM_JOB_ID").map(|job| match lookup("SLURM_STEP_ID") {
                Some(step) => format!("{job}.{step}"),
                None => job,
            })
        })
        .or_else(|| lookup("OMPI_MCA_ess_base_jobid"))
        .or_else(|| lookup("PMIX_NAMESPACE"))
        .unwrap_or_else(|| "default".to_string());

    sanitize_session(&raw)
}

/// Restrict a session identifier to characters safe in a single path component.
pub(crate) fn sanitize_session(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "default".to_string(),
        s => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_no_launcher_is_standalone() {
        assert_eq!(detect_with(env(&[])), Ok(Capability::Standalone));
    }

    #[test]
    fn test_single_participant_is_standalone() {
        let lookup = env(&[("OMPI_COMM_WORLD_RANK", "0"), ("OMPI_COMM_WORLD_SIZE", "1")]);
        assert_eq!(detect_with(lookup), Ok(Capability::Standalone));
    }

    #[test]
    fn test_open_mpi_cooperating() {
        let lookup = env(&[("OMPI_COMM_WORLD_RANK", "2"), ("OMPI_COMM_WORLD_SIZE", "4")]);
        assert_eq!(
            detect_with(lookup),
            Ok(Capability::Cooperating {
                rank: 2,
                world_size: 4
            })
        );
    }

    #[test]
    fn test_explicit_convention_takes_precedence() {
        let lookup = env(&[
            ("COREDUCE_RANK", "1"),
            ("COREDUCE_WORLD_SIZE", "3"),
            ("SLURM_PROCID", "0"),
            ("SLURM_NTASKS", "8"),
        ]);
        assert_eq!(
            detect_with(lookup),
            Ok(Capability::Cooperating {
                rank: 1,
                world_size: 3
            })
        );
    }

    #[test]
    fn test_slurm_batch_script_is_standalone() {
        // sbatch exports the allocation size to the batch step itself
        let lookup = env(&[
            ("SLURM_PROCID", "0"),
            ("SLURM_NTASKS", "4"),
            ("SLURM_JOB_ID", "991"),
        ]);
        assert_eq!(detect_with(lookup), Ok(Capability::Standalone));

        let lookup = env(&[
            ("SLURM_PROCID", "0"),
            ("SLURM_NTASKS", "4"),
            ("SLURM_STEP_NUM_TASKS", "1"),
        ]);
        assert_eq!(detect_with(lookup), Ok(Capability::Standalone));
    }

    #[test]
    fn test_slurm_step_cooperating() {
        let lookup = env(&[
            ("SLURM_PROCID", "2"),
            ("SLURM_NTASKS", "8"),
            ("SLURM_STEP_NUM_TASKS", "4"),
        ]);
        assert_eq!(
            detect_with(lookup),
            Ok(Capability::Cooperating {
                rank: 2,
                world_size: 4
            })
        );
    }

    #[test]
    fn test_missing_world_size() {
        let lookup = env(&[("PMI_RANK", "0")]);
        assert!(matches!(
            detect_with(lookup),
            Err(DetectionError::MissingWorldSize { size_var: "PMI_SIZE", .. })
        ));
    }

    #[test]
    fn test_unparsable_rank() {
        let lookup = env(&[("SLURM_PROCID", "two"), ("SLURM_STEP_NUM_TASKS", "4")]);
        assert_eq!(
            detect_with(lookup),
            Err(DetectionError::Unparsable {
                var: "SLURM_PROCID",
                value: "two".to_string()
            })
        );
    }

    #[test]
    fn test_zero_world_size() {
        let lookup = env(&[("COREDUCE_RANK", "0"), ("COREDUCE_WORLD_SIZE", "0")]);
        assert!(matches!(
            detect_with(lookup),
            Err(DetectionError::ZeroWorldSize { .. })
        ));
    }

    #[test]
    fn test_rank_out_of_range() {
        let lookup = env(&[("COREDUCE_RANK", "3"), ("COREDUCE_WORLD_SIZE", "3")]);
        assert!(matches!(
            detect_with(lookup),
            Err(DetectionError::RankOutOfRange {
                rank: 3,
                world_size: 3,
                ..
            })
        ));
    }

    #[test]
    fn test_session_id_sources() {
        assert_eq!(session_id_with(env(&[])), "default");
        assert_eq!(
            session_id_with(env(&[("SLURM_JOB_ID", "991"), ("SLURM_STEP_ID", "0")])),
            "991.0"
        );
        assert_eq!(
            session_id_with(env(&[("COREDUCE_SESSION", "run/7"), ("SLURM_JOB_ID", "1")])),
            "run_7"
        );
        assert_eq!(session_id_with(env(&[("PMIX_NAMESPACE", "..")])), "default");
    }

    #[test]
    fn test_standalone_job_list_is_full_range() {
        assert_eq!(Capability::Standalone.job_list(4), vec![0, 1, 2, 3]);
        assert_eq!(Capability::Standalone.world_size(), 1);
        assert_eq!(Capability::Standalone.rank(), None);
    }
}
