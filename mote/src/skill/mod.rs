//! Declarative extension packages.
//!
//! A skill contributes tools, prompt fragments, and hook bindings. Two
//! on-disk formats coexist: a JSON `manifest.json` with full tables, and a
//! Markdown `SKILL.md` whose YAML frontmatter carries metadata and gating
//! requirements. The [`SkillManager`] owns discovery and the
//! registered/active lifecycle.

mod gating;
mod manager;
mod manifest;
mod version;

pub use gating::{GatingRequirements, is_eligible};
pub use manager::{ActiveSkill, PromptFragment, SkillManager};
pub use manifest::{
    DEFAULT_TOOL_TIMEOUT_SECS, SkillEntry, SkillHook, SkillManifest, SkillMarkdown, SkillPrompt,
    SkillSource, SkillToolDef, parse_skill_markdown,
};
pub use version::{SkillUpdater, VersionCheck, check_updates};
