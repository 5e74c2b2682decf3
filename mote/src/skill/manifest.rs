//! Skill package formats: `manifest.json` and `SKILL.md`.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Tool timeout applied when a manifest omits one.
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;

fn id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9-]+$").expect("static pattern"))
}

fn handler_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_./-]+\.js#[A-Za-z_$][A-Za-z0-9_$]*$").expect("static pattern")
    })
}

/// One tool contributed by a skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillToolDef {
    /// Registry name.
    pub name: String,
    /// Description shown to the model.
    #[serde(default)]
    pub description: String,
    /// Handler reference: `relative/path.js#function`.
    pub handler: String,
    /// JSON Schema for the tool's parameters.
    #[serde(default)]
    pub parameters: Option<Value>,
    /// Execution timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Runtime hint; only `js` is currently meaningful.
    #[serde(default)]
    pub runtime: Option<String>,
}

impl SkillToolDef {
    /// The effective execution timeout.
    #[must_use]
    pub fn timeout_secs(&self) -> u64 {
        self.timeout.unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS)
    }

    /// Split the handler into `(script path, function name)`.
    #[must_use]
    pub fn handler_parts(&self) -> Option<(&str, &str)> {
        self.handler.split_once('#')
    }
}

/// One prompt fragment contributed by a skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillPrompt {
    /// Fragment name.
    pub name: String,
    /// Inline content; mutually exclusive with `file`.
    #[serde(default)]
    pub content: Option<String>,
    /// File-backed content, relative to the skill directory.
    #[serde(default)]
    pub file: Option<String>,
    /// Tags for collector queries.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One hook binding contributed by a skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillHook {
    /// Hook point name.
    #[serde(rename = "type")]
    pub hook_type: String,
    /// Handler reference, same form as tool handlers.
    pub handler: String,
    /// Dispatch priority; lower fires first.
    #[serde(default)]
    pub priority: i32,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
}

/// A parsed `manifest.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillManifest {
    /// Kebab-case identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Semver version.
    pub version: String,
    /// What the skill does.
    #[serde(default)]
    pub description: String,
    /// Author attribution.
    #[serde(default)]
    pub author: Option<String>,
    /// Contributed tools.
    #[serde(default)]
    pub tools: Vec<SkillToolDef>,
    /// Contributed prompt fragments.
    #[serde(default)]
    pub prompts: Vec<SkillPrompt>,
    /// Contributed hook bindings.
    #[serde(default)]
    pub hooks: Vec<SkillHook>,
    /// Default configuration.
    #[serde(default)]
    pub config: Option<Value>,
    /// JSON Schema constraining `config`.
    #[serde(default, rename = "configSchema")]
    pub config_schema: Option<Value>,
    /// Ids of skills that must be active first.
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl SkillManifest {
    /// Parse and validate a manifest document.
    pub fn parse(raw: &str) -> Result<Self> {
        let manifest: Self = serde_json::from_str(raw)
            .map_err(|e| Error::configuration(format!("invalid skill manifest: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Structural validation: id shape, semver version, handler references.
    pub fn validate(&self) -> Result<()> {
        if !id_pattern().is_match(&self.id) {
            return Err(Error::configuration(format!(
                "skill id '{}' must match ^[a-z0-9-]+$",
                self.id
            )));
        }
        semver::Version::parse(&self.version).map_err(|e| {
            Error::configuration(format!(
                "skill '{}' version '{}' is not semver: {e}",
                self.id, self.version
            ))
        })?;

        for tool in &self.tools {
            validate_handler(&self.id, &tool.handler)?;
        }
        for hook in &self.hooks {
            validate_handler(&self.id, &hook.handler)?;
        }
        Ok(())
    }
}

/// Reject absolute paths and parent traversals in handler references.
fn validate_handler(skill_id: &str, handler: &str) -> Result<()> {
    if handler.starts_with('/') || handler.contains("..") || !handler_pattern().is_match(handler) {
        return Err(Error::configuration(format!(
            "skill '{skill_id}' handler '{handler}' must be '<relative/path>.js#<function>' inside the skill directory"
        )));
    }
    Ok(())
}

/// Frontmatter of a `SKILL.md` package.
#[derive(Debug, Clone, Deserialize)]
pub struct SkillMarkdown {
    /// Skill name; doubles as the id for markdown skills.
    pub name: String,
    /// What the skill does.
    pub description: String,
    /// Project page.
    #[serde(default)]
    pub homepage: Option<String>,
    /// Inline object or JSON string with gating metadata under the
    /// `openclaw` namespace.
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl SkillMarkdown {
    /// The gating metadata namespace, decoded from either an inline
    /// object or a JSON string.
    #[must_use]
    pub fn gating_metadata(&self) -> Option<Value> {
        let metadata = self.metadata.as_ref()?;
        let decoded = match metadata {
            Value::String(raw) => serde_json::from_str(raw).ok()?,
            other => other.clone(),
        };
        match &decoded {
            Value::Object(map) => map.get("openclaw").cloned(),
            _ => None,
        }
    }
}

/// Parse a `SKILL.md` document: YAML frontmatter between `---` delimiters,
/// followed by the markdown body.
pub fn parse_skill_markdown(raw: &str) -> Result<(SkillMarkdown, String)> {
    let rest = raw
        .strip_prefix("---")
        .ok_or_else(|| Error::configuration("SKILL.md must start with a '---' frontmatter block"))?;
    let end = rest
        .find("\n---")
        .ok_or_else(|| Error::configuration("SKILL.md frontmatter is not closed by '---'"))?;
    let frontmatter = &rest[..end];
    let body = rest[end + 4..].trim_start_matches('\n').to_string();

    let yaml: serde_yaml::Value = serde_yaml::from_str(frontmatter)
        .map_err(|e| Error::configuration(format!("invalid SKILL.md frontmatter: {e}")))?;
    let json = serde_json::to_value(yaml)
        .map_err(|e| Error::configuration(format!("invalid SKILL.md frontmatter: {e}")))?;
    let meta: SkillMarkdown = serde_json::from_value(json)
        .map_err(|e| Error::configuration(format!("SKILL.md frontmatter: {e}")))?;

    if !id_pattern().is_match(&meta.name) {
        return Err(Error::configuration(format!(
            "SKILL.md name '{}' must match ^[a-z0-9-]+$",
            meta.name
        )));
    }

    Ok((meta, body))
}

/// How a skill was declared on disk.
#[derive(Debug, Clone)]
pub enum SkillSource {
    /// A full `manifest.json` package.
    Manifest(SkillManifest),
    /// A `SKILL.md` package.
    Markdown {
        /// Parsed frontmatter.
        meta: SkillMarkdown,
        /// Markdown body after the frontmatter.
        body: String,
    },
}

/// One discovered skill in the registry.
#[derive(Debug, Clone)]
pub struct SkillEntry {
    /// Skill id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Version, when declared (markdown skills have none).
    pub version: Option<String>,
    /// Description used for LLM discovery.
    pub description: String,
    /// Directory the skill lives in.
    pub dir: PathBuf,
    /// The declaration backing this entry.
    pub source: SkillSource,
}

impl SkillEntry {
    /// The location a model should read to learn the skill.
    #[must_use]
    pub fn location(&self) -> PathBuf {
        match &self.source {
            SkillSource::Manifest(_) => self.dir.join("manifest.json"),
            SkillSource::Markdown { .. } => self.dir.join("SKILL.md"),
        }
    }

    /// Dependencies declared by the skill.
    #[must_use]
    pub fn dependencies(&self) -> &[String] {
        match &self.source {
            SkillSource::Manifest(m) => &m.dependencies,
            SkillSource::Markdown { .. } => &[],
        }
    }

    /// Build an entry from a manifest on disk.
    #[must_use]
    pub fn from_manifest(dir: &Path, manifest: SkillManifest) -> Self {
        Self {
            id: manifest.id.clone(),
            name: manifest.name.clone(),
            version: Some(manifest.version.clone()),
            description: manifest.description.clone(),
            dir: dir.to_path_buf(),
            source: SkillSource::Manifest(manifest),
        }
    }

    /// Build an entry from a parsed `SKILL.md`.
    #[must_use]
    pub fn from_markdown(dir: &Path, meta: SkillMarkdown, body: String) -> Self {
        Self {
            id: meta.name.clone(),
            name: meta.name.clone(),
            version: None,
            description: meta.description.clone(),
            dir: dir.to_path_buf(),
            source: SkillSource::Markdown { meta, body },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_full_manifest() {
        let manifest = SkillManifest::parse(
            r#"{
                "id": "git-helper",
                "name": "Git Helper",
                "version": "1.2.0",
                "description": "Git workflow helpers",
                "tools": [{
                    "name": "git_status",
                    "description": "Show working tree status",
                    "handler": "tools/git.js#status",
                    "parameters": {"type": "object", "properties": {}}
                }],
                "prompts": [{"name": "usage", "content": "Use git_status first.", "tags": ["git"]}],
                "dependencies": ["base-tools"]
            }"#,
        )
        .unwrap();

        assert_eq!(manifest.id, "git-helper");
        assert_eq!(manifest.tools[0].timeout_secs(), DEFAULT_TOOL_TIMEOUT_SECS);
        assert_eq!(
            manifest.tools[0].handler_parts(),
            Some(("tools/git.js", "status"))
        );
    }

    #[test]
    fn rejects_bad_ids_and_versions() {
        let bad_id = r#"{"id": "Git Helper", "name": "x", "version": "1.0.0"}"#;
        assert!(SkillManifest::parse(bad_id).is_err());

        let bad_version = r#"{"id": "git", "name": "x", "version": "one"}"#;
        assert!(SkillManifest::parse(bad_version).is_err());
    }

    #[test]
    fn rejects_escaping_handlers() {
        for handler in ["/abs/path.js#fn", "../outside.js#fn", "tool.js", "tool.js#"] {
            let raw = format!(
                r#"{{"id": "x", "name": "x", "version": "1.0.0",
                    "tools": [{{"name": "t", "handler": "{handler}"}}]}}"#
            );
            assert!(SkillManifest::parse(&raw).is_err(), "accepted {handler}");
        }
    }

    #[test]
    fn parses_skill_markdown_with_inline_metadata() {
        let raw = r#"---
name: weather
description: Fetch weather reports
homepage: https://example.com
metadata:
  openclaw:
    os: ["linux", "macos"]
    requires:
      env: ["WEATHER_API_KEY"]
---
# Weather

Call the weather API.
"#;
        let (meta, body) = parse_skill_markdown(raw).unwrap();
        assert_eq!(meta.name, "weather");
        assert!(body.starts_with("# Weather"));

        let gating = meta.gating_metadata().unwrap();
        assert_eq!(gating["requires"]["env"][0], "WEATHER_API_KEY");
    }

    #[test]
    fn parses_metadata_given_as_json_string() {
        let raw = "---\nname: pinger\ndescription: Ping things\nmetadata: '{\"openclaw\": {\"requires\": {\"bins\": [\"ping\"]}}}'\n---\nbody\n";
        let (meta, _) = parse_skill_markdown(raw).unwrap();
        let gating = meta.gating_metadata().unwrap();
        assert_eq!(gating["requires"]["bins"][0], "ping");
    }

    #[test]
    fn missing_frontmatter_is_an_error() {
        assert!(parse_skill_markdown("# no frontmatter").is_err());
        assert!(parse_skill_markdown("---\nname: x\ndescription: y").is_err());
    }
}
