//! Skill gating predicates.
//!
//! Manifest skills are always eligible. Markdown skills are included iff
//! the OS matches and every gating predicate passes: required binaries on
//! PATH, environment variables set, paths existing after environment
//! expansion.

use std::path::Path;

use serde_json::Value;
use tracing::debug;

/// Gating requirements decoded from SKILL.md metadata.
#[derive(Debug, Clone, Default)]
pub struct GatingRequirements {
    /// Operating systems the skill supports; empty means all.
    pub os: Vec<String>,
    /// Binaries that must all be on PATH.
    pub bins: Vec<String>,
    /// Binaries of which at least one must be on PATH.
    pub any_bins: Vec<String>,
    /// Environment variables that must be set and non-empty.
    pub env: Vec<String>,
    /// Paths that must exist after environment-variable expansion.
    pub paths: Vec<String>,
}

impl GatingRequirements {
    /// Decode requirements from the `openclaw` metadata namespace.
    #[must_use]
    pub fn from_metadata(metadata: &Value) -> Self {
        let strings = |v: Option<&Value>| -> Vec<String> {
            v.and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };

        let requires = metadata.get("requires");
        Self {
            os: strings(metadata.get("os")),
            bins: strings(requires.and_then(|r| r.get("bins"))),
            any_bins: strings(requires.and_then(|r| r.get("anyBins"))),
            env: strings(requires.and_then(|r| r.get("env"))),
            paths: strings(requires.and_then(|r| r.get("paths"))),
        }
    }

    /// Whether every predicate passes on this machine.
    #[must_use]
    pub fn satisfied(&self) -> bool {
        if !self.os.is_empty() && !self.os.iter().any(|os| os == std::env::consts::OS) {
            debug!(required = ?self.os, "Skill gated out: OS mismatch");
            return false;
        }
        for bin in &self.bins {
            if !binary_on_path(bin) {
                debug!(bin = %bin, "Skill gated out: binary missing");
                return false;
            }
        }
        if !self.any_bins.is_empty() && !self.any_bins.iter().any(|b| binary_on_path(b)) {
            debug!(any_of = ?self.any_bins, "Skill gated out: no alternative binary found");
            return false;
        }
        for var in &self.env {
            if std::env::var(var).map(|v| v.is_empty()).unwrap_or(true) {
                debug!(var = %var, "Skill gated out: env var unset");
                return false;
            }
        }
        for path in &self.paths {
            if !Path::new(&expand_env(path)).exists() {
                debug!(path = %path, "Skill gated out: path missing");
                return false;
            }
        }
        true
    }
}

/// Whether a markdown skill with the given gating metadata is eligible.
/// `None` metadata means no gating: always eligible.
#[must_use]
pub fn is_eligible(metadata: Option<&Value>) -> bool {
    match metadata {
        Some(metadata) => GatingRequirements::from_metadata(metadata).satisfied(),
        None => true,
    }
}

fn binary_on_path(name: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(name).is_file())
}

/// Expand `~`, `$VAR`, and `${VAR}` references.
fn expand_env(raw: &str) -> String {
    let mut out = raw.to_string();
    if let Some(home) = dirs::home_dir() {
        if out == "~" {
            out = home.to_string_lossy().into_owned();
        } else if let Some(rest) = raw.strip_prefix("~/") {
            out = home.join(rest).to_string_lossy().into_owned();
        }
    }

    while let Some(start) = out.find("${") {
        let Some(end) = out[start..].find('}') else {
            break;
        };
        let var = out[start + 2..start + end].to_string();
        let value = std::env::var(&var).unwrap_or_default();
        out.replace_range(start..start + end + 1, &value);
    }

    if let Some(idx) = out.find('$') {
        let tail = &out[idx + 1..];
        let len = tail
            .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
            .unwrap_or(tail.len());
        if len > 0 {
            let var = tail[..len].to_string();
            let value = std::env::var(&var).unwrap_or_default();
            out.replace_range(idx..idx + 1 + len, &value);
        }
    }

    out
}
