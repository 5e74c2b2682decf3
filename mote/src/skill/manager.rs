//! The skill lifecycle manager.
//!
//! Skills move `registered -> active -> registered`. Activation validates
//! dependencies, registers tools (rolling back on any failure), resolves
//! prompt fragments, and records hook bindings. Deactivation refuses while
//! another active skill still depends on the one being removed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::js::{RuntimePool, Sandbox};
use crate::store::SkillConfigStore;
use crate::tool::SharedToolRegistry;

use super::gating::is_eligible;
use super::manifest::{
    SkillEntry, SkillHook, SkillManifest, SkillSource, parse_skill_markdown,
};

/// A resolved prompt fragment from an active skill.
#[derive(Debug, Clone)]
pub struct PromptFragment {
    /// Fragment name.
    pub name: String,
    /// Resolved content.
    pub content: String,
    /// Tags for collector queries.
    pub tags: Vec<String>,
}

/// Bookkeeping for one active skill.
#[derive(Debug, Clone)]
pub struct ActiveSkill {
    /// Skill id.
    pub id: String,
    /// Tool names this activation registered.
    pub tools: Vec<String>,
    /// Resolved prompt fragments.
    pub prompts: Vec<PromptFragment>,
    /// Recorded hook bindings.
    pub hooks: Vec<SkillHook>,
    /// Dependencies declared at activation time.
    pub dependencies: Vec<String>,
}

#[derive(Default)]
struct ManagerState {
    registered: HashMap<String, SkillEntry>,
    active: HashMap<String, ActiveSkill>,
}

/// Discovers skills under configured roots and drives their lifecycle.
pub struct SkillManager {
    roots: Vec<PathBuf>,
    registry: SharedToolRegistry,
    pool: Arc<RuntimePool>,
    sandbox: Arc<Sandbox>,
    config_store: Arc<dyn SkillConfigStore>,
    state: Mutex<ManagerState>,
}

impl std::fmt::Debug for SkillManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("skill state lock poisoned");
        f.debug_struct("SkillManager")
            .field("roots", &self.roots)
            .field("registered", &state.registered.len())
            .field("active", &state.active.len())
            .finish_non_exhaustive()
    }
}

impl SkillManager {
    /// Create a manager over the given roots.
    #[must_use]
    pub fn new(
        roots: Vec<PathBuf>,
        registry: SharedToolRegistry,
        pool: Arc<RuntimePool>,
        sandbox: Arc<Sandbox>,
        config_store: Arc<dyn SkillConfigStore>,
    ) -> Self {
        Self {
            roots,
            registry,
            pool,
            sandbox,
            config_store,
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Scan one root, re-deriving the registered set.
    ///
    /// Already-active skills keep their entries even when their directory
    /// has vanished; inactive entries from prior scans are dropped so
    /// refreshes never accumulate ghosts.
    pub fn scan_directory(&self, root: &Path) -> Result<usize> {
        let discovered = discover(root);
        let count = discovered.len();

        let mut state = self.state.lock().expect("skill state lock poisoned");
        let active_ids: Vec<String> = state.active.keys().cloned().collect();
        state
            .registered
            .retain(|id, _| active_ids.iter().any(|a| a == id));
        for entry in discovered {
            state.registered.insert(entry.id.clone(), entry);
        }

        info!(root = %root.display(), count, "Skill root scanned");
        Ok(count)
    }

    /// Scan every configured root.
    pub fn scan_all_paths(&self) -> Result<usize> {
        let mut total = 0;
        for root in self.roots.clone() {
            total += self.scan_directory(&root)?;
        }
        Ok(total)
    }

    /// Ids of currently registered skills, sorted.
    #[must_use]
    pub fn registered_ids(&self) -> Vec<String> {
        let state = self.state.lock().expect("skill state lock poisoned");
        let mut ids: Vec<String> = state.registered.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ids of currently active skills, sorted.
    #[must_use]
    pub fn active_ids(&self) -> Vec<String> {
        let state = self.state.lock().expect("skill state lock poisoned");
        let mut ids: Vec<String> = state.active.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Look up a registered entry.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<SkillEntry> {
        let state = self.state.lock().expect("skill state lock poisoned");
        state.registered.get(id).cloned()
    }

    /// Activate a registered skill.
    ///
    /// All declared dependencies must already be active. Tool registration
    /// rolls back on any failure, leaving the registry untouched.
    pub fn activate(&self, id: &str, config: Option<Value>) -> Result<()> {
        let mut state = self.state.lock().expect("skill state lock poisoned");

        if state.active.contains_key(id) {
            return Ok(());
        }
        let entry = state
            .registered
            .get(id)
            .cloned()
            .ok_or_else(|| Error::configuration(format!("skill '{id}' is not registered")))?;

        let dependencies = entry.dependencies().to_vec();
        for dep in &dependencies {
            if !state.active.contains_key(dep) {
                return Err(Error::configuration(format!(
                    "skill '{id}' requires '{dep}' to be active first"
                )));
            }
        }

        let (tools, prompts, hooks) = match &entry.source {
            SkillSource::Manifest(manifest) => self.bind_manifest(&entry.dir, manifest)?,
            SkillSource::Markdown { .. } => (Vec::new(), Vec::new(), Vec::new()),
        };

        if let Some(config) = config {
            self.config_store.save(id, config);
        }

        info!(skill = %id, tools = tools.len(), prompts = prompts.len(), "Skill activated");
        state.active.insert(
            id.to_string(),
            ActiveSkill {
                id: id.to_string(),
                tools,
                prompts,
                hooks,
                dependencies,
            },
        );
        Ok(())
    }

    /// Register a manifest skill's tools and resolve its prompts.
    fn bind_manifest(
        &self,
        dir: &Path,
        manifest: &SkillManifest,
    ) -> Result<(Vec<String>, Vec<PromptFragment>, Vec<SkillHook>)> {
        let mut registered = Vec::new();

        for tool in &manifest.tools {
            let Some((script, function)) = tool.handler_parts() else {
                self.rollback(&registered);
                return Err(Error::configuration(format!(
                    "skill '{}' tool '{}' has a malformed handler",
                    manifest.id, tool.name
                )));
            };
            let script_path = dir.join(script);
            if !script_path.is_file() {
                self.rollback(&registered);
                return Err(Error::configuration(format!(
                    "skill '{}' handler script '{}' does not exist",
                    manifest.id,
                    script_path.display()
                )));
            }

            let adapter = crate::js::JsScriptTool::new(
                &tool.name,
                tool.description.clone(),
                tool.parameters
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({ "type": "object", "properties": {} })),
                script_path,
                Some(function.to_string()),
                Some(Duration::from_secs(tool.timeout_secs())),
                Arc::clone(&self.pool),
                Arc::clone(&self.sandbox),
            );
            self.registry
                .write()
                .expect("registry lock poisoned")
                .register(Arc::new(adapter));
            registered.push(tool.name.clone());
        }

        let mut prompts = Vec::new();
        for prompt in &manifest.prompts {
            let content = match (&prompt.content, &prompt.file) {
                (Some(content), _) => content.clone(),
                (None, Some(file)) => match std::fs::read_to_string(dir.join(file)) {
                    Ok(content) => content,
                    Err(e) => {
                        self.rollback(&registered);
                        return Err(Error::configuration(format!(
                            "skill '{}' prompt file '{file}': {e}",
                            manifest.id
                        )));
                    }
                },
                (None, None) => {
                    self.rollback(&registered);
                    return Err(Error::configuration(format!(
                        "skill '{}' prompt '{}' has neither content nor file",
                        manifest.id, prompt.name
                    )));
                }
            };
            prompts.push(PromptFragment {
                name: prompt.name.clone(),
                content,
                tags: prompt.tags.clone(),
            });
        }

        Ok((registered, prompts, manifest.hooks.clone()))
    }

    fn rollback(&self, registered: &[String]) {
        let mut registry = self.registry.write().expect("registry lock poisoned");
        for name in registered {
            registry.unregister(name);
        }
    }

    /// Deactivate an active skill: unregister its tools and drop its
    /// prompts. Fails while another active skill depends on it.
    pub fn deactivate(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().expect("skill state lock poisoned");

        if let Some(dependent) = state
            .active
            .values()
            .find(|a| a.id != id && a.dependencies.iter().any(|d| d == id))
        {
            return Err(Error::configuration(format!(
                "skill '{id}' is still required by active skill '{}'",
                dependent.id
            )));
        }

        let Some(active) = state.active.remove(id) else {
            return Err(Error::configuration(format!("skill '{id}' is not active")));
        };

        self.rollback(&active.tools);
        debug!(skill = %id, "Skill deactivated");
        Ok(())
    }

    /// Prompt fragments of one active skill.
    #[must_use]
    pub fn prompts_for(&self, id: &str) -> Vec<PromptFragment> {
        let state = self.state.lock().expect("skill state lock poisoned");
        state
            .active
            .get(id)
            .map(|a| a.prompts.clone())
            .unwrap_or_default()
    }

    /// Prompt fragments carrying a tag, across all active skills.
    #[must_use]
    pub fn prompts_tagged(&self, tag: &str) -> Vec<PromptFragment> {
        let state = self.state.lock().expect("skill state lock poisoned");
        let mut ids: Vec<&String> = state.active.keys().collect();
        ids.sort();
        ids.iter()
            .flat_map(|id| &state.active[id.as_str()].prompts)
            .filter(|p| p.tags.iter().any(|t| t == tag))
            .cloned()
            .collect()
    }

    /// Hook bindings for a hook point, across active skills, by priority.
    #[must_use]
    pub fn hooks_for(&self, hook_type: &str) -> Vec<(String, SkillHook)> {
        let state = self.state.lock().expect("skill state lock poisoned");
        let mut hooks: Vec<(String, SkillHook)> = state
            .active
            .values()
            .flat_map(|a| {
                a.hooks
                    .iter()
                    .filter(|h| h.hook_type == hook_type)
                    .map(|h| (a.id.clone(), h.clone()))
            })
            .collect();
        hooks.sort_by_key(|(_, h)| h.priority);
        hooks
    }

    /// The compact skills document injected into system prompts.
    ///
    /// Lets the model discover skills by description and opt into reading
    /// a single location with the host's read-file tool.
    #[must_use]
    pub fn format_skills_xml(&self) -> String {
        let ids = self.registered_ids();
        self.format_skills_xml_filtered(&ids)
    }

    /// The skills document restricted to the given ids.
    #[must_use]
    pub fn format_skills_xml_filtered(&self, ids: &[String]) -> String {
        let state = self.state.lock().expect("skill state lock poisoned");
        let mut entries: Vec<&SkillEntry> = ids
            .iter()
            .filter_map(|id| state.registered.get(id))
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));

        if entries.is_empty() {
            return String::new();
        }

        let mut out = String::from("<available_skills>\n");
        for entry in entries {
            out.push_str(&format!(
                "<skill id=\"{}\"><name>{}</name><description>{}</description><location>{}</location></skill>\n",
                escape_xml(&entry.id),
                escape_xml(&entry.name),
                escape_xml(&entry.description),
                escape_xml(&entry.location().to_string_lossy()),
            ));
        }
        out.push_str("</available_skills>");
        out
    }
}

/// Discover eligible skills directly under a root.
fn discover(root: &Path) -> Vec<SkillEntry> {
    let mut entries = Vec::new();
    let Ok(dirs) = std::fs::read_dir(root) else {
        warn!(root = %root.display(), "Skill root unreadable");
        return entries;
    };

    for dir in dirs.filter_map(|e| e.ok()) {
        let path = dir.path();
        if !path.is_dir() {
            continue;
        }

        let manifest_path = path.join("manifest.json");
        if manifest_path.is_file() {
            match std::fs::read_to_string(&manifest_path)
                .map_err(|e| Error::configuration(e.to_string()))
                .and_then(|raw| SkillManifest::parse(&raw))
            {
                Ok(manifest) => entries.push(SkillEntry::from_manifest(&path, manifest)),
                Err(e) => warn!(path = %manifest_path.display(), error = %e, "Skipping bad manifest"),
            }
            continue;
        }

        let markdown_path = path.join("SKILL.md");
        if markdown_path.is_file() {
            match std::fs::read_to_string(&markdown_path)
                .map_err(|e| Error::configuration(e.to_string()))
                .and_then(|raw| parse_skill_markdown(&raw))
            {
                Ok((meta, body)) => {
                    if is_eligible(meta.gating_metadata().as_ref()) {
                        entries.push(SkillEntry::from_markdown(&path, meta, body));
                    } else {
                        debug!(path = %markdown_path.display(), "Skill gated out");
                    }
                }
                Err(e) => warn!(path = %markdown_path.display(), error = %e, "Skipping bad SKILL.md"),
            }
        }
    }

    entries
}

fn escape_xml(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::js::{PoolConfig, SandboxConfig};
    use crate::store::{MemoryKvStore, MemorySkillConfigStore};
    use crate::tool::{ToolRegistry, shared};

    fn write_skill(root: &Path, id: &str, manifest: &Value) {
        let dir = root.join(id);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("manifest.json"),
            serde_json::to_string_pretty(manifest).unwrap(),
        )
        .unwrap();
    }

    fn manager_for(root: &Path) -> (SkillManager, SharedToolRegistry) {
        let registry = shared(ToolRegistry::new());
        let pool = RuntimePool::new(PoolConfig {
            max_size: 1,
            memory_limit: 0,
            ..PoolConfig::default()
        });
        let sandbox = Arc::new(Sandbox::new(
            SandboxConfig::default(),
            Arc::new(MemoryKvStore::new()),
        ));
        let manager = SkillManager::new(
            vec![root.to_path_buf()],
            Arc::clone(&registry),
            pool,
            sandbox,
            Arc::new(MemorySkillConfigStore::new()),
        );
        (manager, registry)
    }

    fn tool_manifest(id: &str, deps: &[&str]) -> Value {
        serde_json::json!({
            "id": id,
            "name": id,
            "version": "1.0.0",
            "description": format!("skill {id}"),
            "tools": [{
                "name": format!("{id}_run"),
                "description": "runs",
                "handler": "tool.js#run"
            }],
            "dependencies": deps
        })
    }

    #[tokio::test]
    async fn activation_registers_and_deactivation_restores() {
        let root = tempfile::tempdir().unwrap();
        write_skill(root.path(), "base", &tool_manifest("base", &[]));
        std::fs::write(
            root.path().join("base/tool.js"),
            "module.exports = { run: () => 'ok' };",
        )
        .unwrap();

        let (manager, registry) = manager_for(root.path());
        manager.scan_all_paths().unwrap();
        assert_eq!(manager.registered_ids(), vec!["base"]);

        let before = registry.read().unwrap().names();
        manager.activate("base", None).unwrap();
        assert!(registry.read().unwrap().contains("base_run"));

        manager.deactivate("base").unwrap();
        assert_eq!(registry.read().unwrap().names(), before);
    }

    #[tokio::test]
    async fn activation_requires_active_dependencies() {
        let root = tempfile::tempdir().unwrap();
        write_skill(root.path(), "base", &tool_manifest("base", &[]));
        std::fs::write(
            root.path().join("base/tool.js"),
            "module.exports = { run: () => 'ok' };",
        )
        .unwrap();
        write_skill(root.path(), "extra", &tool_manifest("extra", &["base"]));
        std::fs::write(
            root.path().join("extra/tool.js"),
            "module.exports = { run: () => 'ok' };",
        )
        .unwrap();

        let (manager, _registry) = manager_for(root.path());
        manager.scan_all_paths().unwrap();

        let err = manager.activate("extra", None).unwrap_err();
        assert!(err.to_string().contains("requires 'base'"));

        manager.activate("base", None).unwrap();
        manager.activate("extra", None).unwrap();

        let err = manager.deactivate("base").unwrap_err();
        assert!(err.to_string().contains("still required"));

        manager.deactivate("extra").unwrap();
        manager.deactivate("base").unwrap();
    }

    #[tokio::test]
    async fn failed_activation_rolls_back_tools() {
        let root = tempfile::tempdir().unwrap();
        write_skill(
            root.path(),
            "broken",
            &serde_json::json!({
                "id": "broken",
                "name": "broken",
                "version": "1.0.0",
                "tools": [
                    {"name": "good", "handler": "tool.js#run"},
                    {"name": "bad", "handler": "missing.js#run"}
                ]
            }),
        );
        std::fs::write(
            root.path().join("broken/tool.js"),
            "module.exports = { run: () => 'ok' };",
        )
        .unwrap();

        let (manager, registry) = manager_for(root.path());
        manager.scan_all_paths().unwrap();

        assert!(manager.activate("broken", None).is_err());
        assert!(registry.read().unwrap().is_empty());
        assert!(manager.active_ids().is_empty());
    }

    #[tokio::test]
    async fn rescan_preserves_active_state_without_ghosts() {
        let root = tempfile::tempdir().unwrap();
        write_skill(root.path(), "keeper", &tool_manifest("keeper", &[]));
        std::fs::write(
            root.path().join("keeper/tool.js"),
            "module.exports = { run: () => 'ok' };",
        )
        .unwrap();
        write_skill(root.path(), "ghost", &tool_manifest("ghost", &[]));
        std::fs::write(
            root.path().join("ghost/tool.js"),
            "module.exports = { run: () => 'ok' };",
        )
        .unwrap();

        let (manager, _registry) = manager_for(root.path());
        manager.scan_all_paths().unwrap();
        manager.activate("keeper", None).unwrap();

        std::fs::remove_dir_all(root.path().join("ghost")).unwrap();
        manager.scan_all_paths().unwrap();

        assert_eq!(manager.registered_ids(), vec!["keeper"]);
        assert_eq!(manager.active_ids(), vec!["keeper"]);
    }

    #[tokio::test]
    async fn skills_xml_is_compact_and_escaped() {
        let root = tempfile::tempdir().unwrap();
        write_skill(
            root.path(),
            "fmt",
            &serde_json::json!({
                "id": "fmt",
                "name": "Formatter <fast & safe>",
                "version": "0.1.0",
                "description": "Formats things"
            }),
        );

        let (manager, _registry) = manager_for(root.path());
        manager.scan_all_paths().unwrap();

        let xml = manager.format_skills_xml();
        assert!(xml.starts_with("<available_skills>"));
        assert!(xml.ends_with("</available_skills>"));
        assert!(xml.contains("Formatter &lt;fast &amp; safe&gt;"));
        assert!(xml.contains("manifest.json"));
    }

    #[tokio::test]
    async fn prompt_fragments_are_collected_by_tag() {
        let root = tempfile::tempdir().unwrap();
        write_skill(
            root.path(),
            "prompts",
            &serde_json::json!({
                "id": "prompts",
                "name": "prompts",
                "version": "1.0.0",
                "prompts": [
                    {"name": "a", "content": "alpha", "tags": ["greeting"]},
                    {"name": "b", "content": "beta", "tags": ["other"]}
                ]
            }),
        );

        let (manager, _registry) = manager_for(root.path());
        manager.scan_all_paths().unwrap();
        manager.activate("prompts", None).unwrap();

        let tagged = manager.prompts_tagged("greeting");
        assert_eq!(tagged.len(), 1);
        assert_eq!(tagged[0].content, "alpha");
        assert_eq!(manager.prompts_for("prompts").len(), 2);
    }
}
