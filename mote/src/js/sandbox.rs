//! The per-execution security envelope.
//!
//! `setup` wires one runtime for one script execution: a watcher task that
//! interrupts the VM when the derived context times out or is cancelled,
//! and the capability-gated `mote` host object (`log`/`fs`/`http`/`kv`)
//! plus a minimal `console`. `cleanup` unwinds in the safe order: the
//! watcher is stopped before the derived context is cancelled, so a benign
//! unwind can never interrupt an already-finished VM.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rquickjs::{CatchResultExt, Function};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::store::KvStore;

use super::runtime::JsRuntime;

/// Globals injected by the sandbox; scrubbed on release and cleanup.
pub const INJECTED_GLOBALS: &[&str] = &[
    "mote",
    "console",
    "__mote_log",
    "__mote_fs",
    "__mote_http",
    "__mote_kv",
    "__mote_unwrap",
];

/// Key prefix isolating sandbox kv traffic in the host store.
const KV_PREFIX: &str = "mote:kv:";

/// The JS prelude assembling the ergonomic `mote` API over the raw host
/// functions. Raw functions return a `{ok}` / `{err}` envelope; the
/// prelude unwraps it and throws on error.
const PRELUDE: &str = r#"
globalThis.__mote_unwrap = (raw) => {
    const r = JSON.parse(raw);
    if (r.err !== undefined) throw new Error(r.err);
    return r.ok;
};
globalThis.console = {
    log: (...a) => __mote_log("info", a.map(String).join(" ")),
    warn: (...a) => __mote_log("warn", a.map(String).join(" ")),
    error: (...a) => __mote_log("error", a.map(String).join(" ")),
};
globalThis.mote = {
    log: {
        debug: (m) => __mote_log("debug", String(m)),
        info: (m) => __mote_log("info", String(m)),
        warn: (m) => __mote_log("warn", String(m)),
        error: (m) => __mote_log("error", String(m)),
    },
    fs: {
        readFile: (p) => __mote_unwrap(__mote_fs("read", String(p), "")),
        writeFile: (p, data) => __mote_unwrap(__mote_fs("write", String(p), String(data))),
        exists: (p) => __mote_unwrap(__mote_fs("exists", String(p), "")),
        readDir: (p) => __mote_unwrap(__mote_fs("readdir", String(p), "")),
    },
    http: {
        get: (url) => __mote_unwrap(__mote_http("GET", String(url), "")),
        post: (url, body) => __mote_unwrap(__mote_http("POST", String(url), String(body))),
    },
    kv: {
        get: (k) => __mote_unwrap(__mote_kv("get", String(k), "")),
        set: (k, v) => __mote_unwrap(__mote_kv("set", String(k), JSON.stringify(v))),
        delete: (k) => __mote_unwrap(__mote_kv("delete", String(k), "")),
    },
};
"#;

/// Sandbox limits and allow-lists.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Wall-clock bound for one script execution.
    pub timeout: Duration,
    /// Filesystem roots scripts may touch. Home-relative entries are
    /// expanded at construction.
    pub fs_allowlist: Vec<PathBuf>,
    /// Destination hosts `mote.http` may reach. `None` allows all.
    pub http_allowlist: Option<Vec<String>>,
    /// Upper bound on one `mote.fs.writeFile` payload.
    pub max_write_bytes: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let mut fs_allowlist = Vec::new();
        if let Some(config) = dirs::config_dir() {
            fs_allowlist.push(config.join("mote"));
        }
        fs_allowlist.push(std::env::temp_dir());
        Self {
            timeout: Duration::from_secs(30),
            fs_allowlist,
            http_allowlist: None,
            max_write_bytes: 10 * 1024 * 1024,
        }
    }
}

impl SandboxConfig {
    /// Expand `~`-relative allow-list entries against the home directory.
    #[must_use]
    pub fn expanded(mut self) -> Self {
        self.fs_allowlist = self
            .fs_allowlist
            .iter()
            .map(|p| expand_home(&p.to_string_lossy()))
            .collect();
        self
    }
}

/// Live handles for one sandboxed execution, consumed by `cleanup`.
#[derive(Debug)]
pub struct SandboxGuard {
    done: CancellationToken,
    exec: CancellationToken,
    watcher: Option<JoinHandle<()>>,
}

struct HostState {
    config: SandboxConfig,
    kv: Arc<dyn KvStore>,
    script: String,
}

/// The per-execution security envelope.
pub struct Sandbox {
    config: SandboxConfig,
    kv: Arc<dyn KvStore>,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Create a sandbox over the given kv backend.
    #[must_use]
    pub fn new(config: SandboxConfig, kv: Arc<dyn KvStore>) -> Self {
        Self {
            config: config.expanded(),
            kv,
        }
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Wire a runtime for one script execution using the configured
    /// timeout.
    pub fn setup(
        &self,
        rt: &JsRuntime,
        cancel: &CancellationToken,
        script_name: &str,
        execution_id: &str,
    ) -> Result<SandboxGuard> {
        self.setup_with_timeout(rt, cancel, script_name, execution_id, self.config.timeout)
    }

    /// Wire a runtime for one script execution with an explicit timeout.
    pub fn setup_with_timeout(
        &self,
        rt: &JsRuntime,
        cancel: &CancellationToken,
        script_name: &str,
        execution_id: &str,
        timeout: Duration,
    ) -> Result<SandboxGuard> {
        let exec = cancel.child_token();
        let done = CancellationToken::new();
        let flag = rt.interrupt_flag();

        debug!(script = %script_name, execution = %execution_id, "Sandbox setup");

        let watcher = tokio::spawn({
            let exec = exec.clone();
            let done = done.clone();
            let script = script_name.to_string();
            async move {
                tokio::select! {
                    () = done.cancelled() => {}
                    () = exec.cancelled() => {
                        flag.store(true, std::sync::atomic::Ordering::Relaxed);
                        warn!(script = %script, "Script interrupted: context cancelled");
                    }
                    () = tokio::time::sleep(timeout) => {
                        flag.store(true, std::sync::atomic::Ordering::Relaxed);
                        warn!(script = %script, ?timeout, "Script interrupted: timeout");
                    }
                }
            }
        });

        self.inject(rt, script_name)?;

        Ok(SandboxGuard {
            done,
            exec,
            watcher: Some(watcher),
        })
    }

    /// Unwind one execution: stop the watcher, cancel the derived context,
    /// remove injected globals, clear interrupts.
    pub async fn cleanup(&self, rt: &JsRuntime, mut guard: SandboxGuard) {
        guard.done.cancel();
        if let Some(watcher) = guard.watcher.take() {
            let _ = watcher.await;
        }
        guard.exec.cancel();
        rt.clear_globals(INJECTED_GLOBALS);
        rt.clear_interrupt();
    }

    /// Out-of-band path check used by tool invocations.
    pub fn validate_path(&self, raw: &str) -> Result<PathBuf> {
        validate_path(&self.config, raw)
    }

    fn inject(&self, rt: &JsRuntime, script_name: &str) -> Result<()> {
        let state = Arc::new(HostState {
            config: self.config.clone(),
            kv: Arc::clone(&self.kv),
            script: script_name.to_string(),
        });

        rt.with(|ctx| -> std::result::Result<(), rquickjs::Error> {
            let globals = ctx.globals();

            {
                let state = Arc::clone(&state);
                globals.set(
                    "__mote_log",
                    Function::new(ctx.clone(), move |level: String, message: String| -> bool {
                        host_log(&state, &level, &message);
                        true
                    })?,
                )?;
            }
            {
                let state = Arc::clone(&state);
                globals.set(
                    "__mote_fs",
                    Function::new(
                        ctx.clone(),
                        move |op: String, path: String, data: String| -> String {
                            envelope(host_fs(&state, &op, &path, &data))
                        },
                    )?,
                )?;
            }
            {
                let state = Arc::clone(&state);
                globals.set(
                    "__mote_http",
                    Function::new(
                        ctx.clone(),
                        move |method: String, url: String, body: String| -> String {
                            envelope(host_http(&state, &method, &url, &body))
                        },
                    )?,
                )?;
            }
            {
                let state = Arc::clone(&state);
                globals.set(
                    "__mote_kv",
                    Function::new(
                        ctx.clone(),
                        move |op: String, key: String, value: String| -> String {
                            envelope(host_kv(&state, &op, &key, &value))
                        },
                    )?,
                )?;
            }

            Ok(())
        })
        .map_err(|e| Error::execution("sandbox", format!("host API injection failed: {e}")))?;

        rt.with(|ctx| {
            ctx.eval::<(), _>(PRELUDE)
                .catch(&ctx)
                .map_err(|e| Error::execution("sandbox", format!("prelude failed: {e}")))
        })
    }
}

fn envelope(result: std::result::Result<Value, String>) -> String {
    let body = match result {
        Ok(ok) => serde_json::json!({ "ok": ok }),
        Err(err) => serde_json::json!({ "err": err }),
    };
    body.to_string()
}

fn host_log(state: &HostState, level: &str, message: &str) {
    match level {
        "debug" => debug!(script = %state.script, "{message}"),
        "warn" => warn!(script = %state.script, "{message}"),
        "error" => tracing::error!(script = %state.script, "{message}"),
        _ => tracing::info!(script = %state.script, "{message}"),
    }
}

fn host_fs(
    state: &HostState,
    op: &str,
    raw_path: &str,
    data: &str,
) -> std::result::Result<Value, String> {
    if op == "exists" {
        let Ok(path) = validate_path(&state.config, raw_path) else {
            return Ok(Value::Bool(false));
        };
        return Ok(Value::Bool(path.exists()));
    }

    let path = validate_path(&state.config, raw_path).map_err(|e| e.to_string())?;
    match op {
        "read" => std::fs::read_to_string(&path)
            .map(Value::String)
            .map_err(|e| format!("read {}: {e}", path.display())),
        "write" => {
            if data.len() as u64 > state.config.max_write_bytes {
                return Err(format!(
                    "write exceeds the {} byte limit",
                    state.config.max_write_bytes
                ));
            }
            std::fs::write(&path, data)
                .map(|()| Value::Bool(true))
                .map_err(|e| format!("write {}: {e}", path.display()))
        }
        "readdir" => {
            let entries = std::fs::read_dir(&path)
                .map_err(|e| format!("readdir {}: {e}", path.display()))?;
            let names: Vec<Value> = entries
                .filter_map(|e| e.ok())
                .map(|e| Value::String(e.file_name().to_string_lossy().into_owned()))
                .collect();
            Ok(Value::Array(names))
        }
        other => Err(format!("unsupported fs operation '{other}'")),
    }
}

fn host_http(
    state: &HostState,
    method: &str,
    raw_url: &str,
    body: &str,
) -> std::result::Result<Value, String> {
    let url = reqwest::Url::parse(raw_url).map_err(|e| format!("invalid url: {e}"))?;

    if let Some(allowed) = &state.config.http_allowlist {
        let host = url.host_str().unwrap_or_default();
        if !allowed.iter().any(|a| a == host) {
            return Err(format!("http host '{host}' is not allow-listed"));
        }
    }

    let client = reqwest::blocking::Client::builder()
        .timeout(state.config.timeout)
        .build()
        .map_err(|e| format!("http client: {e}"))?;

    let request = match method {
        "POST" => client.post(url).body(body.to_string()),
        _ => client.get(url),
    };
    let response = request.send().map_err(|e| format!("http: {e}"))?;
    let status = response.status().as_u16();
    let text = response.text().map_err(|e| format!("http body: {e}"))?;

    Ok(serde_json::json!({ "status": status, "body": text }))
}

fn host_kv(
    state: &HostState,
    op: &str,
    key: &str,
    value: &str,
) -> std::result::Result<Value, String> {
    let prefixed = format!("{KV_PREFIX}{key}");
    match op {
        "get" => Ok(state
            .kv
            .get(&prefixed)
            .map(|raw| {
                // Stored values are JSON; fall back to the raw string.
                serde_json::from_str(&raw).unwrap_or(Value::String(raw))
            })
            .unwrap_or(Value::Null)),
        "set" => {
            state.kv.set(&prefixed, value.to_string());
            Ok(Value::Bool(true))
        }
        "delete" => Ok(Value::Bool(state.kv.delete(&prefixed))),
        other => Err(format!("unsupported kv operation '{other}'")),
    }
}

fn expand_home(raw: &str) -> PathBuf {
    if raw == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

/// Normalize a path lexically, rejecting traversal above the root.
fn normalize(path: &Path) -> Option<PathBuf> {
    if !path.is_absolute() {
        return None;
    }
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Some(out)
}

fn validate_path(config: &SandboxConfig, raw: &str) -> Result<PathBuf> {
    let expanded = expand_home(raw);
    let normalized = normalize(&expanded).ok_or_else(|| {
        Error::capability_denied(format!("path '{raw}' is not an absolute, traversal-free path"))
    })?;

    for allowed in &config.fs_allowlist {
        if let Some(root) = normalize(allowed) {
            if normalized.starts_with(&root) {
                return Ok(normalized);
            }
        }
    }
    Err(Error::capability_denied(format!(
        "path '{raw}' is outside the sandbox allow-list"
    )))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::store::MemoryKvStore;

    fn sandbox_for(dir: &Path) -> Sandbox {
        Sandbox::new(
            SandboxConfig {
                timeout: Duration::from_secs(5),
                fs_allowlist: vec![dir.to_path_buf()],
                http_allowlist: Some(vec![]),
                max_write_bytes: 1024,
            },
            Arc::new(MemoryKvStore::new()),
        )
    }

    #[test]
    fn path_validation_enforces_allowlist() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox_for(dir.path());

        assert!(sandbox
            .validate_path(&dir.path().join("notes.txt").to_string_lossy())
            .is_ok());
        assert!(sandbox.validate_path("/etc/passwd").is_err());
        assert!(sandbox.validate_path("relative/path").is_err());

        let escape = format!("{}/../../etc/passwd", dir.path().display());
        assert!(sandbox.validate_path(&escape).is_err());
    }

    #[tokio::test]
    async fn fs_api_round_trips_within_allowlist() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox_for(dir.path());
        let mut rt = JsRuntime::new(0).unwrap();
        let guard = sandbox
            .setup(&rt, &CancellationToken::new(), "test.js", "exec-1")
            .unwrap();

        let file = dir.path().join("out.txt");
        let script = format!(
            "mote.fs.writeFile({p}, 'hello'); mote.fs.readFile({p})",
            p = serde_json::to_string(&file.to_string_lossy()).unwrap()
        );
        let out = rt.eval(&script).unwrap();
        assert_eq!(out, "hello");

        sandbox.cleanup(&rt, guard).await;
        assert_eq!(rt.eval("String(typeof mote)").unwrap(), "undefined");
    }

    #[tokio::test]
    async fn fs_denial_surfaces_as_js_error() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox_for(dir.path());
        let mut rt = JsRuntime::new(0).unwrap();
        let guard = sandbox
            .setup(&rt, &CancellationToken::new(), "test.js", "exec-1")
            .unwrap();

        let err = rt
            .eval("try { mote.fs.readFile('/etc/passwd'); 'no-error' } catch (e) { String(e.message) }")
            .unwrap();
        assert!(err.contains("allow-list"));

        sandbox.cleanup(&rt, guard).await;
    }

    #[tokio::test]
    async fn kv_api_serializes_and_decodes() {
        let dir = tempfile::tempdir().unwrap();
        let kv = Arc::new(MemoryKvStore::new());
        let sandbox = Sandbox::new(
            SandboxConfig {
                fs_allowlist: vec![dir.path().to_path_buf()],
                ..SandboxConfig::default()
            },
            kv.clone(),
        );
        let mut rt = JsRuntime::new(0).unwrap();
        let guard = sandbox
            .setup(&rt, &CancellationToken::new(), "test.js", "exec-1")
            .unwrap();

        let out = rt
            .eval("mote.kv.set('answer', {n: 42}); JSON.stringify(mote.kv.get('answer'))")
            .unwrap();
        assert_eq!(out, r#"{"n":42}"#);
        assert!(kv.get("mote:kv:answer").is_some());

        let out = rt.eval("String(mote.kv.delete('answer'))").unwrap();
        assert_eq!(out, "true");

        sandbox.cleanup(&rt, guard).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timeout_interrupts_a_runaway_script() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = sandbox_for(dir.path());
        let rt = JsRuntime::new(0).unwrap();
        let guard = sandbox
            .setup_with_timeout(
                &rt,
                &CancellationToken::new(),
                "spin.js",
                "exec-1",
                Duration::from_millis(100),
            )
            .unwrap();

        let (rt, result) = tokio::task::spawn_blocking(move || {
            let mut rt = rt;
            let result = rt.eval("while (true) {} 'unreachable'");
            (rt, result)
        })
        .await
        .unwrap();

        assert!(result.is_err());
        assert!(rt.interrupt_flag().load(Ordering::Relaxed));

        sandbox.cleanup(&rt, guard).await;
        assert!(!rt.interrupt_flag().load(Ordering::Relaxed));
    }
}
