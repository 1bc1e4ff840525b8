//! JSON snapshot of the league state.
//!
//! A snapshot is written to a temporary file next to the target and renamed over it, so a crash
//! mid-write leaves the previous snapshot intact.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::match_record::MatchRecord;
use crate::registry::PeerRecord;
use crate::standings::{OutcomeTally, PointsTable, StandingsEntry};
use crate::tournament_strategy::ScheduledRound;

/// Format version written in every snapshot.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything needed to resume a league. Behaviour scores are not part of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Always [`SNAPSHOT_VERSION`].
    pub version: u32,
    /// Write time.
    #[serde(with = "time::serde::rfc3339")]
    pub saved_at: OffsetDateTime,
    /// Every registered peer, ejected ones included.
    pub peers: Vec<PeerRecord>,
    /// Full league schedule.
    pub schedule: Vec<ScheduledRound>,
    /// Rounds already run.
    pub completed_rounds: Vec<u32>,
    /// Sealed matches.
    pub matches: Vec<MatchRecord>,
    /// Points awarded per result.
    pub points: PointsTable,
    /// Table rows.
    pub standings: Vec<StandingsEntry>,
    /// Outcome counts behind the table.
    pub tally: OutcomeTally,
}

/// Location of the snapshot file.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    /// Store at `path`. Nothing is read or written yet.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the snapshot on disk.
    pub fn save(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("could not create {}", dir.display()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .with_context(|| format!("could not create a temporary file in {}", dir.display()))?;
        serde_json::to_writer_pretty(&mut tmp, snapshot).context("could not encode snapshot")?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .with_context(|| format!("could not write {}", self.path.display()))?;

        debug!(
            path = %self.path.display(),
            matches = snapshot.matches.len(),
            completed_rounds = ?snapshot.completed_rounds,
            "snapshot saved"
        );
        Ok(())
    }

    /// Read the snapshot, `None` if there is none yet.
    pub fn load(&self) -> anyhow::Result<Option<Snapshot>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("could not read {}", self.path.display()))
            }
        };
        let snapshot: Snapshot = serde_json::from_str(&raw)
            .with_context(|| format!("corrupted snapshot {}", self.path.display()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            bail!(
                "unsupported snapshot version {} in {}",
                snapshot.version,
                self.path.display()
            );
        }
        info!(
            path = %self.path.display(),
            peers = snapshot.peers.len(),
            matches = snapshot.matches.len(),
            "snapshot loaded"
        );
        Ok(Some(snapshot))
    }
}
