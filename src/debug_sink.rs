use std::fs;
use std::path::{Path, PathBuf};

/// Optional side channel for raw fetched pages and table diagnostics.
/// Writes are fire-and-forget: failures are logged and never propagate into
/// the pipeline. When debug mode is off every call is a no-op.
#[derive(Debug, Clone)]
pub struct DebugSink {
    dir: Option<PathBuf>,
}

impl DebugSink {
    pub fn new(dir: &Path, enabled: bool) -> Self {
        Self {
            dir: enabled.then(|| dir.to_path_buf()),
        }
    }

    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn write(&self, name: &str, contents: &str) {
        let Some(dir) = &self.dir else { return };
        if let Err(e) = fs::create_dir_all(dir) {
            log::warn!("Could not create debug directory {}: {e}", dir.display());
            return;
        }
        let path = dir.join(name);
        match fs::write(&path, contents) {
            Ok(()) => log::debug!("Saved debug file to {}", path.display()),
            Err(e) => log::warn!("Could not write debug file {}: {e}", path.display()),
        }
    }
}
