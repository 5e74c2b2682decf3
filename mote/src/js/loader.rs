//! Filesystem-backed tool loading with debounced hot-reload.
//!
//! The loader scans a directory for `*.js` tool scripts, extracts their
//! metadata by executing each file under a `module.exports` harness, and
//! registers an adapter per script. A filesystem watcher applies
//! create/write events through a 100 ms per-path debounce where the latest
//! event within the window wins; remove events unregister the tool.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result, ToolError};
use crate::tool::{CallContext, SharedToolRegistry, Tool};

use super::pool::RuntimePool;
use super::sandbox::Sandbox;

/// Per-path debounce window for reload events.
const DEBOUNCE: Duration = Duration::from_millis(100);

/// Metadata extracted from a tool script.
#[derive(Debug, Clone, serde::Deserialize)]
struct ScriptMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameters: Option<Value>,
}

/// A registered tool backed by a JS script on disk.
///
/// The script is re-read on every invocation, so a reload only has to
/// refresh the registered metadata.
pub struct JsScriptTool {
    name: String,
    description: String,
    parameters: Value,
    path: PathBuf,
    /// Named export to call (`file.js#fn`); `None` calls `run`/`handler`.
    handler_fn: Option<String>,
    timeout: Option<Duration>,
    pool: Arc<RuntimePool>,
    sandbox: Arc<Sandbox>,
}

impl std::fmt::Debug for JsScriptTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsScriptTool")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("handler_fn", &self.handler_fn)
            .finish_non_exhaustive()
    }
}

impl JsScriptTool {
    /// Create a script-backed tool.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        path: impl Into<PathBuf>,
        handler_fn: Option<String>,
        timeout: Option<Duration>,
        pool: Arc<RuntimePool>,
        sandbox: Arc<Sandbox>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            path: path.into(),
            handler_fn,
            timeout,
            pool,
            sandbox,
        }
    }

    /// The script path backing this tool.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Tool for JsScriptTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn parameters(&self) -> Value {
        self.parameters.clone()
    }

    async fn invoke(
        &self,
        ctx: &CallContext,
        args: Value,
    ) -> std::result::Result<Value, ToolError> {
        let source = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| ToolError::Execution(format!("read {}: {e}", self.path.display())))?;
        let script = invoke_harness(&source, self.handler_fn.as_deref(), &args)
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        let rt = self
            .pool
            .acquire(&ctx.cancel)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;

        let execution_id = Uuid::new_v4().to_string();
        let guard = match self.timeout {
            Some(timeout) => self.sandbox.setup_with_timeout(
                &rt,
                &ctx.cancel,
                &self.name,
                &execution_id,
                timeout,
            ),
            None => self.sandbox.setup(&rt, &ctx.cancel, &self.name, &execution_id),
        };
        let guard = match guard {
            Ok(guard) => guard,
            Err(e) => {
                self.pool.release(rt).await;
                return Err(ToolError::Execution(e.to_string()));
            }
        };

        // Scripts run on a blocking thread so host fs/http calls may block.
        let joined = tokio::task::spawn_blocking(move || {
            let mut rt = rt;
            let out = rt.eval(&script);
            (rt, out)
        })
        .await;

        let (rt, out) = match joined {
            Ok(pair) => pair,
            Err(e) => return Err(ToolError::Execution(format!("script task failed: {e}"))),
        };

        self.sandbox.cleanup(&rt, guard).await;
        self.pool.release(rt).await;

        let text = out.map_err(|e| ToolError::Execution(e.to_string()))?;
        Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
    }
}

/// Build the harness that executes a script's handler with JSON args.
fn invoke_harness(source: &str, handler_fn: Option<&str>, args: &Value) -> Result<String> {
    let args_literal = serde_json::to_string(&args.to_string())?;
    let fn_expr = match handler_fn {
        Some(name) => format!("t[{}]", serde_json::to_string(name)?),
        None => "(typeof t === \"function\" ? t : (t.run || t.handler))".to_string(),
    };
    Ok(format!(
        "(function() {{ \"use strict\"; const module = {{ exports: {{}} }}; const exports = module.exports;\n{source}\n; const t = module.exports; const fn = {fn_expr}; if (typeof fn !== \"function\") throw new Error(\"no invocable handler\"); const args = JSON.parse({args_literal}); const out = fn(args); return JSON.stringify(out === undefined ? null : out); }})()"
    ))
}

/// Build the harness that extracts a script's tool metadata.
fn metadata_harness(source: &str) -> String {
    format!(
        "(function() {{ \"use strict\"; const module = {{ exports: {{}} }}; const exports = module.exports;\n{source}\n; const t = module.exports || {{}}; return JSON.stringify({{ name: t.name || \"\", description: t.description || \"\", parameters: t.parameters || {{ \"type\": \"object\", \"properties\": {{}} }} }}); }})()"
    )
}

struct LoaderInner {
    pool: Arc<RuntimePool>,
    sandbox: Arc<Sandbox>,
    registry: SharedToolRegistry,
    dir: PathBuf,
    /// Registered tool name to backing script path.
    loaded: Mutex<HashMap<String, PathBuf>>,
    /// Pending per-path debounce timers.
    debounce: Mutex<HashMap<PathBuf, JoinHandle<()>>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
    reloads: AtomicUsize,
}

/// Directory-scanning tool loader with hot reload. Cheap to clone; clones
/// share the same state.
#[derive(Clone)]
pub struct ToolLoader {
    inner: Arc<LoaderInner>,
}

impl std::fmt::Debug for ToolLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolLoader")
            .field("dir", &self.inner.dir)
            .field(
                "loaded",
                &self.inner.loaded.lock().expect("loader lock").len(),
            )
            .finish_non_exhaustive()
    }
}

impl ToolLoader {
    /// Create a loader over the given directory and shared registry.
    #[must_use]
    pub fn new(
        pool: Arc<RuntimePool>,
        sandbox: Arc<Sandbox>,
        registry: SharedToolRegistry,
        dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                pool,
                sandbox,
                registry,
                dir: dir.into(),
                loaded: Mutex::new(HashMap::new()),
                debounce: Mutex::new(HashMap::new()),
                watcher: Mutex::new(None),
                watch_task: Mutex::new(None),
                reloads: AtomicUsize::new(0),
            }),
        }
    }

    /// Number of completed (re)loads; a debounced burst counts once.
    #[must_use]
    pub fn reloads(&self) -> usize {
        self.inner.reloads.load(Ordering::Relaxed)
    }

    /// Scan the directory and register every `*.js` tool found.
    pub async fn load_dir(&self) -> Result<usize> {
        let mut count = 0;
        let entries = std::fs::read_dir(&self.inner.dir).map_err(|e| {
            Error::execution(format!("loader:{}", self.inner.dir.display()), e.to_string())
        })?;
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("js") {
                match self.load_file(&path).await {
                    Ok(name) => {
                        debug!(tool = %name, path = %path.display(), "Tool loaded");
                        count += 1;
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "Tool load failed"),
                }
            }
        }
        info!(dir = %self.inner.dir.display(), count, "Tool directory scanned");
        Ok(count)
    }

    /// Load (or reload) one script and register its tool.
    pub async fn load_file(&self, path: &Path) -> Result<String> {
        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::execution(format!("loader:{}", path.display()), e.to_string()))?;

        let metadata = self.extract_metadata(path, &source).await?;
        let name = if metadata.name.is_empty() {
            path.file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "tool".to_string())
        } else {
            metadata.name
        };

        let tool = JsScriptTool::new(
            &name,
            metadata.description,
            metadata
                .parameters
                .unwrap_or_else(|| serde_json::json!({ "type": "object", "properties": {} })),
            path,
            None,
            None,
            Arc::clone(&self.inner.pool),
            Arc::clone(&self.inner.sandbox),
        );

        self.inner
            .registry
            .write()
            .expect("registry lock poisoned")
            .register(Arc::new(tool));
        self.inner
            .loaded
            .lock()
            .expect("loader lock poisoned")
            .insert(name.clone(), path.to_path_buf());
        self.inner.reloads.fetch_add(1, Ordering::Relaxed);

        Ok(name)
    }

    async fn extract_metadata(&self, path: &Path, source: &str) -> Result<ScriptMetadata> {
        let cancel = tokio_util::sync::CancellationToken::new();
        let rt = self.inner.pool.acquire(&cancel).await?;
        let script_name = path.display().to_string();
        let guard = match self.inner.sandbox.setup(
            &rt,
            &cancel,
            &script_name,
            &Uuid::new_v4().to_string(),
        ) {
            Ok(guard) => guard,
            Err(e) => {
                self.inner.pool.release(rt).await;
                return Err(e);
            }
        };

        let harness = metadata_harness(source);
        let joined = tokio::task::spawn_blocking(move || {
            let mut rt = rt;
            let out = rt.eval(&harness);
            (rt, out)
        })
        .await;

        let (rt, out) = match joined {
            Ok(pair) => pair,
            Err(e) => {
                return Err(Error::execution(
                    format!("loader:{}", path.display()),
                    format!("metadata task failed: {e}"),
                ));
            }
        };
        self.inner.sandbox.cleanup(&rt, guard).await;
        self.inner.pool.release(rt).await;

        let text = out?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Unregister a tool by name.
    pub fn unload(&self, name: &str) -> bool {
        self.inner
            .loaded
            .lock()
            .expect("loader lock poisoned")
            .remove(name);
        self.inner
            .registry
            .write()
            .expect("registry lock poisoned")
            .unregister(name)
    }

    /// Unregister whichever tool is backed by the given script path.
    pub fn unload_path(&self, path: &Path) -> bool {
        let name = {
            let loaded = self.inner.loaded.lock().expect("loader lock poisoned");
            loaded
                .iter()
                .find(|(_, p)| p.as_path() == path)
                .map(|(name, _)| name.clone())
        };
        match name {
            Some(name) => self.unload(&name),
            None => false,
        }
    }

    /// Schedule a debounced reload; the latest event within the window
    /// wins, resetting the timer cancels the prior reload.
    pub fn schedule_reload(&self, path: PathBuf) {
        let mut timers = self.inner.debounce.lock().expect("debounce lock poisoned");
        if let Some(previous) = timers.remove(&path) {
            previous.abort();
        }

        let loader = self.clone();
        let key = path.clone();
        timers.insert(
            key.clone(),
            tokio::spawn(async move {
                tokio::time::sleep(DEBOUNCE).await;
                if let Err(e) = loader.load_file(&path).await {
                    warn!(path = %path.display(), error = %e, "Hot reload failed");
                }
                loader
                    .inner
                    .debounce
                    .lock()
                    .expect("debounce lock poisoned")
                    .remove(&key);
            }),
        );
    }

    /// Attach a filesystem watcher applying create/write events through
    /// the debounce and remove events as unloads.
    pub fn watch(&self) -> Result<()> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<notify::Event>();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })
        .map_err(|e| Error::execution("loader watcher", e.to_string()))?;

        watcher
            .watch(&self.inner.dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::execution("loader watcher", e.to_string()))?;

        let loader = self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for path in event.paths {
                    if path.extension().and_then(|e| e.to_str()) != Some("js") {
                        continue;
                    }
                    match event.kind {
                        notify::EventKind::Create(_) | notify::EventKind::Modify(_) => {
                            loader.schedule_reload(path);
                        }
                        notify::EventKind::Remove(_) => {
                            if loader.unload_path(&path) {
                                info!(path = %path.display(), "Tool unloaded on remove");
                            }
                        }
                        _ => {}
                    }
                }
            }
        });

        *self.inner.watcher.lock().expect("watcher lock poisoned") = Some(watcher);
        *self.inner.watch_task.lock().expect("watcher lock poisoned") = Some(task);
        Ok(())
    }

    /// Stop the watcher, cancel pending debounce timers, and unregister
    /// every loaded tool.
    pub fn close(&self) {
        self.inner.watcher.lock().expect("watcher lock poisoned").take();
        if let Some(task) = self
            .inner
            .watch_task
            .lock()
            .expect("watcher lock poisoned")
            .take()
        {
            task.abort();
        }

        let timers: Vec<JoinHandle<()>> = self
            .inner
            .debounce
            .lock()
            .expect("debounce lock poisoned")
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for timer in timers {
            timer.abort();
        }

        let names: Vec<String> = self
            .inner
            .loaded
            .lock()
            .expect("loader lock poisoned")
            .drain()
            .map(|(name, _)| name)
            .collect();
        let mut registry = self.inner.registry.write().expect("registry lock poisoned");
        for name in names {
            registry.unregister(&name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::DelegateContext;
    use crate::js::pool::PoolConfig;
    use crate::js::sandbox::SandboxConfig;
    use crate::store::MemoryKvStore;
    use crate::tool::{ToolRegistry, shared};

    const ECHO_TOOL: &str = r#"
module.exports = {
    name: "echo_upper",
    description: "Uppercases the message argument.",
    parameters: {
        type: "object",
        properties: { message: { type: "string" } },
        required: ["message"]
    },
    run: (args) => args.message.toUpperCase()
};
"#;

    fn fixture(dir: &Path) -> (ToolLoader, SharedToolRegistry) {
        let pool = RuntimePool::new(PoolConfig {
            max_size: 2,
            memory_limit: 0,
            ..PoolConfig::default()
        });
        let sandbox = Arc::new(Sandbox::new(
            SandboxConfig {
                fs_allowlist: vec![dir.to_path_buf()],
                ..SandboxConfig::default()
            },
            Arc::new(MemoryKvStore::new()),
        ));
        let registry = shared(ToolRegistry::new());
        let loader = ToolLoader::new(pool, sandbox, Arc::clone(&registry), dir);
        (loader, registry)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scans_and_registers_tools() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("echo.js"), ECHO_TOOL).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let (loader, registry) = fixture(dir.path());
        let count = loader.load_dir().await.unwrap();
        assert_eq!(count, 1);

        let registry = registry.read().unwrap().clone();
        let tool = registry.get("echo_upper").expect("tool registered");
        assert_eq!(tool.description(), "Uppercases the message argument.");

        let ctx = CallContext::new("s1", DelegateContext::root("main"));
        let out = tool
            .invoke(&ctx, serde_json::json!({"message": "hello"}))
            .await
            .unwrap();
        assert_eq!(out, serde_json::json!("HELLO"));

        loader.close();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn burst_of_writes_reloads_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.js");
        std::fs::write(&path, ECHO_TOOL).unwrap();

        let (loader, registry) = fixture(dir.path());

        loader.schedule_reload(path.clone());
        loader.schedule_reload(path.clone());
        loader.schedule_reload(path.clone());
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(loader.reloads(), 1);
        assert!(registry.read().unwrap().contains("echo_upper"));

        loader.close();
        assert!(!registry.read().unwrap().contains("echo_upper"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn remove_unregisters_by_script_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("echo.js");
        std::fs::write(&path, ECHO_TOOL).unwrap();

        let (loader, registry) = fixture(dir.path());
        loader.load_dir().await.unwrap();
        assert!(registry.read().unwrap().contains("echo_upper"));

        assert!(loader.unload_path(&path));
        assert!(!registry.read().unwrap().contains("echo_upper"));
        assert!(!loader.unload_path(&path));

        loader.close();
    }
}
