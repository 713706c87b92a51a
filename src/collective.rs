//! Store-side collective protocol
//!
//! Cooperating workers never message each other. Every collective call is an
//! agreement round held in a directory of the shared store:
//! `<store>/.coreduce/<session>/<epoch>/<seq>-<label>/<rank>`. A worker publishes
//! its payload, then waits until every rank has published, so each round is also
//! a barrier. All workers read the same payloads and therefore reach the same
//! decision.
//!
//! The epoch is chosen by the leader when the workers connect. The leader first
//! clears whatever an interrupted run left in the session directory, then collects
//! a `join/<rank>` token from every peer and answers each in `ack/<rank>` with the
//! epoch. Leftover rounds therefore never mix with the rounds of a new run.

use crate::environment::Capability;
use crate::errors::{CoReduceError, Result};
use crate::utils::{unique_token, write_atomic};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Name of the directory holding collective sessions inside a store
pub const COLLECTIVE_DIR: &str = ".coreduce";

/// Default delay between checks for missing peers
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

const OK_PREFIX: &str = "ok:";
const ERR_PREFIX: &str = "err:";
const LEFT_LABEL: &str = "left";
const JOIN_DIR: &str = "join";
const ACK_DIR: &str = "ack";
const CLEAR_ATTEMPTS: usize = 10;

/// Coordinates the collective calls of one worker
#[derive(Debug)]
pub enum Coordinator {
    /// Standalone: every round trivially agrees with itself
    Solo,
    /// Cooperating through a session directory of the store
    Shared(SessionRounds),
}

/// Agreement rounds of one cooperating worker
#[derive(Debug)]
pub struct SessionRounds {
    session_dir: PathBuf,
    /// Rounds of this run, inside `session_dir`
    epoch_dir: PathBuf,
    rank: usize,
    world_size: usize,
    sequence: u64,
    poll_interval: Duration,
}

impl Coordinator {
    /// Connect to the other workers of `capability` on the store at `store_root`.
    ///
    /// A collective call: it returns once every worker has joined the session.
    ///
    /// # Errors
    ///
    /// Any I/O error on the session directory.
    pub async fn connect(
        capability: Capability,
        store_root: &Path,
        session: &str,
        poll_interval: Duration,
    ) -> Result<Self> {
        let Capability::Cooperating { rank, world_size } = capability else {
            return Ok(Self::Solo);
        };
        let session_dir = store_root
            .join(COLLECTIVE_DIR)
            .join(crate::environment::sanitize_session(session));
        let handshake = Handshake {
            session_dir: &session_dir,
            rank,
            world_size,
            poll_interval,
        };

        let epoch = if rank == 0 {
            handshake.lead().await?
        } else {
            handshake.follow().await?
        };
        debug!(rank, %epoch, session = %session_dir.display(), "joined collective session");

        Ok(Self::Shared(SessionRounds {
            epoch_dir: session_dir.join(epoch),
            session_dir,
            rank,
            world_size,
            sequence: 0,
            poll_interval,
        }))
    }

    #[must_use]
    pub const fn is_leader(&self) -> bool {
        match self {
            Self::Solo => true,
            Self::Shared(rounds) => rounds.rank == 0,
        }
    }

    /// Publish `payload` and collect every worker's payload, in rank order.
    ///
    /// This is a barrier: it returns only once all workers have reached the same round.
    ///
    /// # Errors
    ///
    /// [`CoReduceError::StaleSession`] if this rank already published in the round, or
    /// any I/O error on the session directory.
    pub async fn exchange(&mut self, label: &str, payload: &str) -> Result<Vec<String>> {
        match self {
            Self::Solo => Ok(vec![payload.to_string()]),
            Self::Shared(rounds) => rounds.exchange(label, payload).await,
        }
    }

    /// Synchronise every worker at `label`.
    ///
    /// # Errors
    ///
    /// See [`Coordinator::exchange`].
    pub async fn barrier(&mut self, label: &str) -> Result<()> {
        self.exchange(label, "").await.map(|_| ())
    }

    /// Require every worker to present the same `fingerprint`.
    ///
    /// # Errors
    ///
    /// [`CoReduceError::CollectiveMismatch`] when fingerprints differ.
    pub async fn agree(&mut self, label: &str, fingerprint: &str) -> Result<()> {
        let payloads = self.exchange(label, fingerprint).await?;
        match payloads.iter().position(|p| p != fingerprint) {
            None => Ok(()),
            Some(rank) => Err(CoReduceError::CollectiveMismatch {
                label: label.to_string(),
                details: format!(
                    "worker {rank} sent {:?}, this worker sent {fingerprint:?}",
                    payloads[rank]
                ),
            }),
        }
    }

    /// Share a local outcome so that every worker fails or succeeds together.
    ///
    /// On success, `describe` summarises the value; summaries must match across workers.
    ///
    /// # Errors
    ///
    /// This worker's own error, [`CoReduceError::PeerFailed`] when only a peer
    /// failed, or [`CoReduceError::CollectiveMismatch`] when successful summaries
    /// differ.
    pub async fn agree_outcome<T, F>(
        &mut self,
        label: &str,
        outcome: Result<T>,
        describe: F,
    ) -> Result<T>
    where
        F: FnOnce(&T) -> String,
    {
        let payload = match &outcome {
            Ok(value) => format!("{OK_PREFIX}{}", describe(value)),
            Err(e) => format!("{ERR_PREFIX}{}", e.kind()),
        };
        let payloads = self.exchange(label, &payload).await?;
        let value = outcome?;

        if let Some((rank, failed)) = payloads
            .iter()
            .enumerate()
            .find(|(_, p)| p.starts_with(ERR_PREFIX))
        {
            return Err(CoReduceError::PeerFailed {
                rank,
                label: label.to_string(),
                kind: failed.trim_start_matches(ERR_PREFIX).to_string(),
            });
        }
        if let Some(rank) = payloads.iter().position(|p| *p != payload) {
            return Err(CoReduceError::CollectiveMismatch {
                label: label.to_string(),
                details: format!(
                    "worker {rank} saw {:?}, this worker saw {payload:?}",
                    payloads[rank]
                ),
            });
        }
        Ok(value)
    }

    /// Leave the session after the final round.
    ///
    /// Every worker records that it has left; the leader waits for all of them and
    /// then removes the session directory.
    ///
    /// # Errors
    ///
    /// Any I/O error on the session directory.
    pub async fn leave(&mut self) -> Result<()> {
        match self {
            Self::Solo => Ok(()),
            Self::Shared(rounds) => rounds.leave().await,
        }
    }
}

/// Joining of one worker to a session directory
struct Handshake<'a> {
    session_dir: &'a Path,
    rank: usize,
    world_size: usize,
    poll_interval: Duration,
}

impl Handshake<'_> {
    /// Clear the session, admit every peer and hand out a fresh epoch.
    async fn lead(&self) -> Result<String> {
        self.clear_stale().await?;
        let join_dir = self.session_dir.join(JOIN_DIR);
        let ack_dir = self.session_dir.join(ACK_DIR);
        tokio::fs::create_dir_all(&join_dir).await?;
        tokio::fs::create_dir_all(&ack_dir).await?;

        let epoch = unique_token();
        let mut tokens = vec![String::new(); self.world_size];
        let mut waiting: Vec<usize> = (1..self.world_size).collect();
        while !waiting.is_empty() {
            let mut still_waiting = Vec::with_capacity(waiting.len());
            for rank in waiting {
                match tokio::fs::read_to_string(join_dir.join(rank.to_string())).await {
                    Ok(token) if !token.is_empty() => tokens[rank] = token,
                    Ok(_) => still_waiting.push(rank),
                    Err(e) if e.kind() == ErrorKind::NotFound => still_waiting.push(rank),
                    Err(e) => return Err(e.into()),
                }
            }
            waiting = still_waiting;
            if !waiting.is_empty() {
                trace!(?waiting, "waiting for peers to join");
                tokio::time::sleep(self.poll_interval).await;
            }
        }

        tokio::fs::create_dir_all(self.session_dir.join(&epoch)).await?;
        for (rank, token) in tokens.iter().enumerate().skip(1) {
            write_atomic(
                &ack_dir.join(rank.to_string()),
                format!("{token} {epoch}").as_bytes(),
            )
            .await?;
        }
        Ok(epoch)
    }

    /// Remove whatever an earlier run left behind.
    ///
    /// Peers may already be writing join tokens, which makes a removal race with
    /// them; those peers rewrite their token once it is gone.
    async fn clear_stale(&self) -> Result<()> {
        if self.has_leftovers().await? {
            warn!(session = %self.session_dir.display(), "clearing stale collective session");
        }
        let mut attempt = 0;
        loop {
            match tokio::fs::remove_dir_all(self.session_dir).await {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
                Err(e) if attempt + 1 < CLEAR_ATTEMPTS => {
                    attempt += 1;
                    debug!(error = %e, attempt, "retrying removal of stale session");
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Whether the session holds anything besides join tokens of this run.
    async fn has_leftovers(&self) -> Result<bool> {
        let mut entries = match tokio::fs::read_dir(self.session_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name() != JOIN_DIR {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Publish a join token until the leader acknowledges it with the epoch.
    async fn follow(&self) -> Result<String> {
        let token = unique_token();
        let join_file = self.session_dir.join(JOIN_DIR).join(self.rank.to_string());
        let ack_file = self.session_dir.join(ACK_DIR).join(self.rank.to_string());

        loop {
            match tokio::fs::read_to_string(&ack_file).await {
                Ok(ack) => {
                    // Acks of an earlier run carry another token and are ignored.
                    if let Some(epoch) = ack
                        .strip_prefix(token.as_str())
                        .and_then(|rest| rest.strip_prefix(' '))
                        .filter(|epoch| !epoch.is_empty())
                    {
                        return Ok(epoch.to_string());
                    }
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }

            let published = tokio::fs::read_to_string(&join_file)
                .await
                .is_ok_and(|current| current == token);
            if !published {
                if let Err(e) = self.publish_join(&join_file, &token).await {
                    // The leader is clearing the session; publish again next time.
                    if e.kind() != ErrorKind::NotFound {
                        return Err(e.into());
                    }
                }
            }
            trace!(rank = self.rank, "waiting for the leader to acknowledge");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn publish_join(&self, join_file: &Path, token: &str) -> std::io::Result<()> {
        if let Some(join_dir) = join_file.parent() {
            tokio::fs::create_dir_all(join_dir).await?;
        }
        write_atomic(join_file, token.as_bytes()).await
    }
}

impl SessionRounds {
    async fn exchange(&mut self, label: &str, payload: &str) -> Result<Vec<String>> {
        let round_dir = self
            .epoch_dir
            .join(format!("{:04}-{label}", self.sequence));
        self.sequence += 1;

        tokio::fs::create_dir_all(&round_dir).await?;
        let own = round_dir.join(self.rank.to_string());
        if own.exists() {
            return Err(CoReduceError::StaleSession {
                path: self.epoch_dir.display().to_string(),
            });
        }
        write_atomic(&own, payload.as_bytes()).await?;
        debug!(rank = self.rank, round = %round_dir.display(), "entered collective round");

        self.wait_for_all(&round_dir).await?;

        let mut payloads = Vec::with_capacity(self.world_size);
        for rank in 0..self.world_size {
            payloads.push(tokio::fs::read_to_string(round_dir.join(rank.to_string())).await?);
        }
        Ok(payloads)
    }

    async fn wait_for_all(&self, dir: &Path) -> Result<()> {
        let mut waiting: Vec<usize> = (0..self.world_size).collect();
        loop {
            waiting.retain(|rank| !dir.join(rank.to_string()).exists());
            if waiting.is_empty() {
                return Ok(());
            }
            trace!(rank = self.rank, ?waiting, "waiting for peers");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn leave(&mut self) -> Result<()> {
        let left_dir = self.epoch_dir.join(LEFT_LABEL);
        tokio::fs::create_dir_all(&left_dir).await?;
        write_atomic(&left_dir.join(self.rank.to_string()), b"").await?;

        // Only the leader lingers; peers never read the session again after this point.
        if self.rank != 0 {
            return Ok(());
        }
        self.wait_for_all(&left_dir).await?;
        tokio::fs::remove_dir_all(&self.session_dir).await?;
        if let Some(parent) = self.session_dir.parent() {
            // Fails harmlessly while other sessions are still active.
            let _ = tokio::fs::remove_dir(parent).await;
        }
        debug!(session = %self.session_dir.display(), "collective session removed");
        Ok(())
    }
}
