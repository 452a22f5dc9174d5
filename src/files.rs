//! Small files the supervisor leaves on disk for other tools.

use crate::configs::FileConfig;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default)]
pub struct RunFiles {
    config: FileConfig,
}

impl RunFiles {
    pub fn new(config: FileConfig) -> Self {
        Self { config }
    }

    /// Writes the pid file and creates the anchor file.
    pub fn create(&self) -> Result<()> {
        let pid = std::process::id().to_string();
        if let Some(path) = &self.config.pidfile {
            write(path, &pid).wrap_err("Failed to write pid file")?;
        }
        if let Some(path) = &self.config.anchor {
            write(path, &pid).wrap_err("Failed to create anchor file")?;
        }
        Ok(())
    }

    /// `None` when no anchor file is configured.
    pub fn anchor_exists(&self) -> Option<bool> {
        self.config.anchor.as_deref().map(Path::exists)
    }

    pub fn write_status(&self, state: &str) {
        if let Some(path) = &self.config.statusfile {
            if let Err(err) = write(path, state) {
                warn!(?err, "Failed to write status file");
            }
        }
    }

    pub fn write_child_status(&self, state: &str) {
        if let Some(path) = &self.config.child_statusfile {
            if let Err(err) = write(path, state) {
                warn!(?err, "Failed to write child status file");
            }
        }
    }

    pub fn write_child_pid(&self, pid: u32) {
        if let Some(path) = &self.config.child_pidfile {
            if let Err(err) = write(path, &pid.to_string()) {
                warn!(?err, "Failed to write child pid file");
            }
        }
    }

    pub fn remove_child_pid(&self) {
        if let Some(path) = &self.config.child_pidfile {
            remove(path);
        }
    }

    /// Reads and deletes the command file. `Ok(None)` if there is none.
    pub fn take_commands(&self) -> Result<Option<Vec<String>>> {
        let Some(path) = &self.config.command else {
            return Ok(None);
        };
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .wrap_err_with(|| format!("Failed to read {}", path.display()))
            }
        };
        fs::remove_file(path).wrap_err_with(|| format!("Failed to delete {}", path.display()))?;
        Ok(Some(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(String::from)
                .collect(),
        ))
    }

    /// Removes everything that only makes sense while the supervisor runs.
    pub fn cleanup(&self) {
        for path in [
            &self.config.pidfile,
            &self.config.child_pidfile,
            &self.config.anchor,
        ]
        .into_iter()
        .flatten()
        {
            remove(path);
        }
    }
}

fn write(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, format!("{contents}\n"))
        .wrap_err_with(|| format!("Failed to write {}", path.display()))
}

fn remove(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed"),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!(?err, path = %path.display(), "Failed to remove file"),
    }
}
