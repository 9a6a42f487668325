//! On-disk run persistence: one pretty-printed JSON document per run.
//!
//! Documents live at `<state_dir>/orchestrator/<parent_card_id>.json` and
//! are the audit trail for a run; they are never deleted. Writes go through
//! a temp file plus rename so a crash can never leave a torn document.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::model::Run;

/// Errors from loading or saving run documents.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state document {path} is not valid JSON: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode state document for {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Store for run state documents under a fixed directory.
#[derive(Debug, Clone)]
pub struct RunStore {
    dir: PathBuf,
}

impl RunStore {
    /// Create a store rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| StoreError::Io {
            action: "create state directory",
            path: dir.clone(),
            source: e,
        })?;
        Ok(Self { dir })
    }

    /// Directory holding the state documents.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the document for a given parent card.
    pub fn path_for(&self, parent_card_id: &str) -> PathBuf {
        self.dir.join(format!("{parent_card_id}.json"))
    }

    /// Load the run for `parent_card_id`, or `None` if no document exists.
    ///
    /// Unknown fields in the document are ignored; missing optional fields
    /// take their defaults, so documents written by older builds stay
    /// loadable.
    pub fn load(&self, parent_card_id: &str) -> Result<Option<Run>, StoreError> {
        let path = self.path_for(parent_card_id);
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::Io {
                    action: "read",
                    path,
                    source: e,
                });
            }
        };
        let run = serde_json::from_str(&contents)
            .map_err(|e| StoreError::Corrupt { path, source: e })?;
        Ok(Some(run))
    }

    /// Persist the run atomically, refreshing its `updated_at` stamp.
    ///
    /// The document is written to `<path>.tmp` and renamed into place;
    /// rename is atomic on the same filesystem.
    pub fn save(&self, run: &mut Run) -> Result<(), StoreError> {
        run.touch();
        let path = self.path_for(&run.parent_card_id);
        let tmp = path.with_extension("json.tmp");

        let contents = serde_json::to_string_pretty(run).map_err(|e| StoreError::Encode {
            path: path.clone(),
            source: e,
        })?;
        fs::write(&tmp, contents).map_err(|e| StoreError::Io {
            action: "write",
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, &path).map_err(|e| StoreError::Io {
            action: "rename into place",
            path,
            source: e,
        })?;
        Ok(())
    }

    /// Parent card ids that already have a state document.
    ///
    /// Used by watch mode to skip cards that were orchestrated before.
    pub fn known_card_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids = Vec::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| StoreError::Io {
            action: "list",
            path: self.dir.clone(),
            source: e,
        })?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(".json") {
                ids.push(stem.to_string());
            }
        }
        Ok(ids)
    }
}
