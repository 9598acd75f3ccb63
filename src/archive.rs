//! # App bundle extraction.
//!
//! An app's code travels through storage as a gzipped tarball. [`deploy`]
//! unpacks one into its spool slot, replacing whatever was there.
//!
//! ## Rules
//! - Deploy is destructive: the target directory is removed first, so a
//!   half-written previous deploy cannot leak stale files.
//! - Entries that would escape the target directory are rejected.
//! - Extraction is CPU/blocking work and runs on the blocking pool, never
//!   on an engine loop.

use std::io::Cursor;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;

use crate::error::ArchiveError;

/// Unpacks a gzipped tarball `blob` into `target`, erasing `target` first.
pub async fn deploy(blob: Vec<u8>, target: &Path) -> Result<(), ArchiveError> {
    let target = target.to_path_buf();
    tokio::task::spawn_blocking(move || unpack(blob, &target))
        .await
        .map_err(|e| ArchiveError::Corrupt {
            reason: format!("extraction task failed: {e}"),
        })?
}

fn unpack(blob: Vec<u8>, target: &PathBuf) -> Result<(), ArchiveError> {
    // Remove stale files from the spool, just in case.
    match std::fs::remove_dir_all(target) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    std::fs::create_dir_all(target)?;

    let mut archive = Archive::new(GzDecoder::new(Cursor::new(blob)));
    let entries = archive.entries().map_err(|e| ArchiveError::Corrupt {
        reason: e.to_string(),
    })?;

    for entry in entries {
        let mut entry = entry.map_err(|e| ArchiveError::Corrupt {
            reason: e.to_string(),
        })?;
        let path = entry.path().map_err(|e| ArchiveError::Corrupt {
            reason: e.to_string(),
        })?;

        if !is_contained(&path) {
            return Err(ArchiveError::Corrupt {
                reason: format!("entry '{}' escapes the target directory", path.display()),
            });
        }

        entry.unpack_in(target)?;
    }

    Ok(())
}

/// True if the relative entry path stays inside the extraction root.
fn is_contained(path: &Path) -> bool {
    let mut depth: i32 = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}
