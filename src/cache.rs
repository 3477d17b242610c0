//! # Build Cache
//!
//! Decides whether a script has to be rebuilt by comparing its current bytes
//! with a snapshot saved after the last successful build. Timestamps are never
//! consulted: touching a file does not force a rebuild, and coarse mtime
//! resolution cannot hide an edit.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::ZxError;

/// Snapshot file name inside a project's output directory.
pub const SNAPSHOT_FILE_NAME: &str = "script.snapshot";

/// The script text read for a staleness check, plus the verdict.
///
/// Keep it around until the build finishes and record exactly these bytes, so
/// an edit made during the build is picked up next time.
#[derive(Debug, Clone)]
pub struct Staleness {
    pub contents: Vec<u8>,
    pub needs_rebuild: bool,
}

/// Snapshot-backed staleness decisions for one script.
#[derive(Debug, Clone)]
pub struct BuildCache {
    snapshot_path: PathBuf,
}

impl BuildCache {
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        Self { snapshot_path: snapshot_path.into() }
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Reads `script` and compares it with the snapshot.
    pub fn check(&self, script: &Path) -> Result<Staleness, ZxError> {
        let contents = fs::read(script).map_err(|e| match e.kind() {
            ErrorKind::NotFound => ZxError::NotFound { what: "script", path: script.to_path_buf() },
            _ => ZxError::io(script, e),
        })?;

        let needs_rebuild = match fs::read(&self.snapshot_path) {
            Ok(previous) => previous != contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No snapshot at {:?}", self.snapshot_path);
                true
            }
            Err(e) => {
                warn!("Could not read snapshot {:?} ({}), rebuilding", self.snapshot_path, e);
                true
            }
        };

        Ok(Staleness { contents, needs_rebuild })
    }

    /// Saves `contents` as the text of the last successful build.
    pub fn record(&self, contents: &[u8]) -> Result<(), ZxError> {
        if let Some(parent) = self.snapshot_path.parent() {
            fs::create_dir_all(parent).map_err(|e| ZxError::io(parent, e))?;
        }
        fs::write(&self.snapshot_path, contents).map_err(|e| ZxError::io(&self.snapshot_path, e))
    }

    /// Forgets the snapshot so the next check always asks for a rebuild.
    pub fn invalidate(&self) -> Result<(), ZxError> {
        match fs::remove_file(&self.snapshot_path) {
            Ok(()) => {
                debug!("Invalidated snapshot {:?}", self.snapshot_path);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ZxError::io(&self.snapshot_path, e)),
        }
    }
}

/// True when `script` differs from the snapshot at `snapshot`, or there is none.
pub fn needs_rebuild(script: &Path, snapshot: &Path) -> Result<bool, ZxError> {
    BuildCache::new(snapshot).check(script).map(|s| s.needs_rebuild)
}
