//! Built-in skill version checking and atomic updates.

use std::path::Path;

use semver::Version;
use tracing::{info, warn};

use crate::error::{Error, Result};

use super::manifest::SkillManifest;

/// Outcome of comparing one built-in skill against the local install.
#[derive(Debug, Clone)]
pub struct VersionCheck {
    /// Skill id.
    pub id: String,
    /// Locally installed version, when present and parseable.
    pub installed: Option<Version>,
    /// Version embedded in the distribution.
    pub embedded: Version,
    /// Whether the local install is missing or older.
    pub needs_update: bool,
}

/// Compare embedded `(id, version)` pairs against skills installed under
/// `root/<id>/manifest.json`.
pub fn check_updates(root: &Path, embedded: &[(&str, &str)]) -> Result<Vec<VersionCheck>> {
    let mut checks = Vec::with_capacity(embedded.len());
    for (id, version) in embedded {
        let embedded_version = Version::parse(version).map_err(|e| {
            Error::configuration(format!("embedded skill '{id}' version '{version}': {e}"))
        })?;

        let installed = std::fs::read_to_string(root.join(id).join("manifest.json"))
            .ok()
            .and_then(|raw| SkillManifest::parse(&raw).ok())
            .and_then(|m| Version::parse(&m.version).ok());

        let needs_update = installed
            .as_ref()
            .map(|i| *i < embedded_version)
            .unwrap_or(true);

        checks.push(VersionCheck {
            id: (*id).to_string(),
            installed,
            embedded: embedded_version,
            needs_update,
        });
    }
    Ok(checks)
}

/// Applies skill updates with rotated backups and rollback.
#[derive(Debug, Clone, Copy)]
pub struct SkillUpdater {
    /// Backups retained per skill.
    pub backups: usize,
}

impl Default for SkillUpdater {
    fn default() -> Self {
        Self { backups: 3 }
    }
}

impl SkillUpdater {
    /// Replace `skill_dir` with `staged_dir`.
    ///
    /// The current install rotates into `<dir>.bak.1`; older backups shift
    /// up and the oldest beyond the retention bound is dropped. A failed
    /// copy restores the previous install.
    pub fn apply(&self, skill_dir: &Path, staged_dir: &Path) -> Result<()> {
        if !staged_dir.is_dir() {
            return Err(Error::configuration(format!(
                "staged skill '{}' is not a directory",
                staged_dir.display()
            )));
        }

        let had_previous = skill_dir.exists();
        if had_previous {
            self.rotate_backups(skill_dir)?;
            std::fs::rename(skill_dir, backup_path(skill_dir, 1))?;
        }

        match copy_tree(staged_dir, skill_dir) {
            Ok(()) => {
                info!(skill = %skill_dir.display(), "Skill updated");
                Ok(())
            }
            Err(e) => {
                warn!(skill = %skill_dir.display(), error = %e, "Skill update failed, rolling back");
                let _ = std::fs::remove_dir_all(skill_dir);
                if had_previous {
                    std::fs::rename(backup_path(skill_dir, 1), skill_dir)?;
                }
                Err(e)
            }
        }
    }

    /// Shift `.bak.N` backups up by one, dropping the oldest.
    fn rotate_backups(&self, skill_dir: &Path) -> Result<()> {
        let oldest = backup_path(skill_dir, self.backups);
        if oldest.exists() {
            std::fs::remove_dir_all(&oldest)?;
        }
        for n in (1..self.backups).rev() {
            let from = backup_path(skill_dir, n);
            if from.exists() {
                std::fs::rename(&from, backup_path(skill_dir, n + 1))?;
            }
        }
        Ok(())
    }
}

fn backup_path(skill_dir: &Path, n: usize) -> std::path::PathBuf {
    let name = skill_dir
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    skill_dir.with_file_name(format!("{name}.bak.{n}"))
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(from) {
        let entry = entry.map_err(|e| Error::execution("skill update", e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| Error::execution("skill update", e.to_string()))?;
        let target = to.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
