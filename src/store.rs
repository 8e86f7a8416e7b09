// Copyright (C) 2025 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::session::{Mode, Session};

/// The current snapshot format version.
const SNAPSHOT_VERSION: u32 = 1;

/// Errors from the snapshot store.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("error accessing snapshot {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt snapshot {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// The on-disk snapshot envelope. YAML, versioned, human-diffable.
#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    session: Session,
}

/// Persists sessions to disk, one snapshot file per mode. Saves are atomic
/// with respect to process crash: the snapshot is written to a temporary file
/// and renamed into place, so an interrupted save never leaves a snapshot
/// that fails to load.
#[derive(Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    /// Creates a store rooted at the given data directory.
    pub fn new<P: AsRef<Path>>(dir: P) -> Store {
        Store {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// The snapshot path for the given mode.
    pub fn path(&self, mode: Mode) -> PathBuf {
        self.dir.join(match mode {
            Mode::Normal => "normal.yaml",
            Mode::SuperLooper => "super_looper.yaml",
        })
    }

    /// Saves the session under its mode's snapshot key.
    pub fn save(&self, session: &Session) -> Result<(), SnapshotError> {
        let path = self.path(session.mode());
        let io_err = |source| SnapshotError::Io {
            path: path.clone(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(io_err)?;

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            session: session.clone(),
        };
        let serialized = serde_yml::to_string(&snapshot).map_err(|e| SnapshotError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let tmp = path.with_extension("yaml.tmp");
        fs::write(&tmp, serialized).map_err(io_err)?;
        fs::rename(&tmp, &path).map_err(io_err)?;

        Ok(())
    }

    /// Loads the snapshot for the given mode. Returns None when no snapshot
    /// exists yet.
    pub fn load(&self, mode: Mode) -> Result<Option<Session>, SnapshotError> {
        let path = self.path(mode);

        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(SnapshotError::Io { path, source }),
        };

        let corrupt = |reason: String| SnapshotError::Corrupt {
            path: path.clone(),
            reason,
        };

        let snapshot: Snapshot =
            serde_yml::from_str(&contents).map_err(|e| corrupt(e.to_string()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(corrupt(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }

        let session = snapshot.session;
        session.validate().map_err(corrupt)?;
        if session.mode() != mode {
            return Err(corrupt(format!(
                "snapshot holds a {} session",
                session.mode()
            )));
        }

        Ok(Some(session))
    }

    /// Loads the snapshot for the given mode, falling back to a fresh empty
    /// session on a missing or corrupt snapshot. Corruption is never fatal.
    pub fn load_or_default(&self, mode: Mode) -> Session {
        match self.load(mode) {
            Ok(Some(session)) => {
                info!(mode = %mode, "Restored session snapshot.");
                session
            }
            Ok(None) => Session::new(mode),
            Err(e) => {
                warn!(
                    err = e.to_string(),
                    mode = %mode,
                    "Unable to load session snapshot, starting fresh."
                );
                Session::new(mode)
            }
        }
    }
}
