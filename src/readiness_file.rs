//! Writes a sentinel file once the configured readiness condition holds across
//! the processes it watches, and removes it on shutdown. Used by orchestrators
//! (Kubernetes startup probes, systemd `sd_notify`-less setups) that need a plain
//! filesystem signal rather than a network probe.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{error, info};

pub struct ReadinessFileManager {
    path: Option<PathBuf>,
    written: AtomicBool,
}

impl ReadinessFileManager {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            written: AtomicBool::new(false),
        }
    }

    /// Writes the sentinel file if configured and not already written. Idempotent.
    pub fn mark_ready(&self) -> io::Result<()> {
        let Some(path) = &self.path else { return Ok(()) };
        if self.written.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, b"ready\n")?;
        info!(path = %path.display(), "wrote readiness file");
        Ok(())
    }

    /// Removes the sentinel file, if one was written. Safe to call unconditionally
    /// during shutdown; a missing file is not an error.
    pub fn clear(&self) {
        let Some(path) = &self.path else { return };
        if !self.written.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = fs::remove_file(path) {
            if err.kind() != io::ErrorKind::NotFound {
                error!(path = %path.display(), error = %err, "failed to remove readiness file");
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.written.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_and_clears_the_sentinel_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ready");
        let manager = ReadinessFileManager::new(Some(path.clone()));

        manager.mark_ready().unwrap();
        assert!(path.exists());

        manager.clear();
        assert!(!path.exists());
    }

    #[test]
    fn no_path_configured_is_a_noop() {
        let manager = ReadinessFileManager::new(None);
        assert!(manager.mark_ready().is_ok());
        assert!(!manager.is_ready());
        manager.clear();
    }

    #[test]
    fn mark_ready_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("ready");
        let manager = ReadinessFileManager::new(Some(path.clone()));

        manager.mark_ready().unwrap();
        manager.mark_ready().unwrap();
        assert!(path.exists());
    }
}
