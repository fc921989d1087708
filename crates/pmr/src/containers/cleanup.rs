//! Cross-process bookkeeping of containers to kill at session end.
//!
//! Every launched container id is appended to a lockfile at a
//! deterministic temp path; the controlling process reaps the whole list
//! once at exit (never a parallel sub-worker). The file persists across
//! crashed runs, so a later session also reaps abandoned containers.
//!
//! Uses the `fs2` crate for cross-platform file locking (MSRV 1.75
//! compatible). Note: std::fs::File::lock() requires Rust 1.89+, so we use
//! fs2 instead.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::containers::lifecycle::kill_container;
use crate::error::{Error, Result};

/// Deterministic lockfile path shared by every process in a session.
pub fn lockfile_path() -> PathBuf {
    std::env::temp_dir().join("pmr_containers.lock")
}

#[derive(Serialize)]
struct LockSidecar {
    pid: u32,
    exe: Option<String>,
    timestamp: String,
}

fn sidecar_path_for(lock_path: &Path) -> PathBuf {
    let ext = lock_path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("lock");
    lock_path.with_extension(format!("{ext}.json"))
}

/// Record who last touched the registry, for post-mortem diagnosis.
fn write_sidecar(lock_path: &Path) {
    let sidecar = LockSidecar {
        pid: std::process::id(),
        exe: std::env::current_exe().ok().map(|p| p.display().to_string()),
        timestamp: Utc::now().to_rfc3339(),
    };
    let sidecar_path = sidecar_path_for(lock_path);
    match serde_json::to_vec_pretty(&sidecar) {
        Ok(payload) => {
            if let Err(e) = fs::write(&sidecar_path, payload) {
                warn!("failed to write lock sidecar {}: {}", sidecar_path.display(), e);
            }
        }
        Err(e) => warn!("failed to serialize lock sidecar: {}", e),
    }
}

/// Open the registry and block until the exclusive advisory lock is held.
///
/// The lock is released when the returned file handle closes (fs2 uses
/// flock/LockFileEx).
fn open_locked(path: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(Error::Lock)?;
    FileExt::lock_exclusive(&file).map_err(Error::Lock)?;
    Ok(file)
}

/// Append a container id to the session registry.
pub fn register(container_id: &str) -> Result<()> {
    register_at(&lockfile_path(), container_id)
}

fn register_at(path: &Path, container_id: &str) -> Result<()> {
    let mut file = open_locked(path)?;
    file.seek(SeekFrom::End(0)).map_err(Error::Lock)?;
    writeln!(file, "{container_id}").map_err(Error::Lock)?;
    write_sidecar(path);
    debug!("registered container {} in {}", container_id, path.display());
    Ok(())
}

/// Stop every registered container and clear the registry.
///
/// Individual kill failures (already removed, daemon gone) are warnings;
/// the reap proceeds through the rest of the list.
pub fn reap() -> Result<()> {
    reap_with(&lockfile_path(), kill_container)
}

fn reap_with<F>(path: &Path, mut kill: F) -> Result<()>
where
    F: FnMut(&str) -> anyhow::Result<()>,
{
    if !path.exists() {
        debug!("no container registry at {}, nothing to reap", path.display());
        return Ok(());
    }

    let mut file = open_locked(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).map_err(Error::Lock)?;
    let ids: Vec<&str> = contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    info!("reaping {} container(s) from {}", ids.len(), path.display());
    for id in ids {
        match kill(id) {
            Ok(()) => debug!("stopped container {}", id),
            Err(e) => warn!("failed to stop container {}: {:#}", id, e),
        }
    }

    file.set_len(0).map_err(Error::Lock)?;
    // Removing while the handle is open works on Unix; elsewhere the
    // truncated file is equally harmless.
    if let Err(e) = fs::remove_file(path) {
        debug!("could not remove {}: {}", path.display(), e);
    }
    let sidecar = sidecar_path_for(path);
    if sidecar.exists() {
        if let Err(e) = fs::remove_file(&sidecar) {
            debug!("could not remove {}: {}", sidecar.display(), e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_register_appends_in_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("containers.lock");

        register_at(&path, "aaa").unwrap();
        register_at(&path, "bbb").unwrap();
        register_at(&path, "ccc").unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let ids: Vec<&str> = contents.lines().collect();
        assert_eq!(ids, vec!["aaa", "bbb", "ccc"]);
        assert!(sidecar_path_for(&path).exists());
    }

    #[test]
    fn test_reap_kills_all_and_removes_registry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("containers.lock");
        register_at(&path, "one").unwrap();
        register_at(&path, "two").unwrap();

        let mut killed = Vec::new();
        reap_with(&path, |id| {
            killed.push(id.to_string());
            Ok(())
        })
        .unwrap();

        assert_eq!(killed, vec!["one", "two"]);
        assert!(!path.exists());
        assert!(!sidecar_path_for(&path).exists());
    }

    #[test]
    fn test_reap_tolerates_kill_failures() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("containers.lock");
        register_at(&path, "gone").unwrap();
        register_at(&path, "alive").unwrap();

        let mut killed = Vec::new();
        reap_with(&path, |id| {
            if id == "gone" {
                anyhow::bail!("No such container: gone");
            }
            killed.push(id.to_string());
            Ok(())
        })
        .unwrap();

        // the failure did not stop the reap, and the registry is gone
        assert_eq!(killed, vec!["alive"]);
        assert!(!path.exists());
    }

    #[test]
    fn test_reap_without_registry_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("containers.lock");
        reap_with(&path, |_| panic!("nothing to kill")).unwrap();
    }
}
