//! An interruptible QuickJS runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rquickjs::{CatchResultExt, Context, Runtime};

use crate::error::{Error, Result};

/// One QuickJS runtime plus its execution context and interrupt flag.
///
/// The interrupt flag is checked by the VM's interrupt handler while a
/// script runs; raising it unblocks any running script with an error.
pub struct JsRuntime {
    runtime: Runtime,
    context: Context,
    interrupt: Arc<AtomicBool>,
    last_used: Instant,
}

impl std::fmt::Debug for JsRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsRuntime")
            .field("interrupted", &self.interrupt.load(Ordering::Relaxed))
            .field("idle_for", &self.last_used.elapsed())
            .finish_non_exhaustive()
    }
}

impl JsRuntime {
    /// Mint a fresh runtime with the given memory bound (zero = unbounded).
    pub fn new(memory_limit: usize) -> Result<Self> {
        let runtime = Runtime::new()
            .map_err(|e| Error::execution("js runtime", format!("runtime init failed: {e}")))?;
        if memory_limit > 0 {
            runtime.set_memory_limit(memory_limit);
        }

        let interrupt = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&interrupt);
        runtime.set_interrupt_handler(Some(Box::new(move || flag.load(Ordering::Relaxed))));

        let context = Context::full(&runtime)
            .map_err(|e| Error::execution("js runtime", format!("context init failed: {e}")))?;

        Ok(Self {
            runtime,
            context,
            interrupt,
            last_used: Instant::now(),
        })
    }

    /// The shared interrupt flag; raising it stops a running script.
    #[must_use]
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    /// Clear a pending interrupt so the next borrower starts clean.
    pub fn clear_interrupt(&self) {
        self.interrupt.store(false, Ordering::Relaxed);
    }

    /// Whether the runtime has sat idle past the given bound.
    #[must_use]
    pub fn is_expired(&self, idle_timeout: Duration) -> bool {
        self.last_used.elapsed() > idle_timeout
    }

    /// Mark the runtime as just used.
    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Run a closure against the execution context.
    pub fn with<F, R>(&self, f: F) -> R
    where
        F: for<'js> FnOnce(rquickjs::Ctx<'js>) -> R,
    {
        self.context.with(f)
    }

    /// Evaluate a script that yields a string.
    pub fn eval(&mut self, source: &str) -> Result<String> {
        self.touch();
        self.context.with(|ctx| {
            ctx.eval::<String, _>(source)
                .catch(&ctx)
                .map_err(|e| Error::execution("js", e.to_string()))
        })
    }

    /// Evaluate a script for its side effects only.
    pub fn eval_discard(&mut self, source: &str) -> Result<()> {
        self.touch();
        self.context.with(|ctx| {
            ctx.eval::<(), _>(source)
                .catch(&ctx)
                .map_err(|e| Error::execution("js", e.to_string()))
        })
    }

    /// Best-effort removal of the named globals.
    pub fn clear_globals(&self, names: &[&str]) {
        let script: String = names
            .iter()
            .map(|n| format!("delete globalThis.{n};"))
            .collect();
        self.context.with(|ctx| {
            let _ = ctx.eval::<(), _>(script.as_str());
        });
    }

    /// Reduce the memory bound for subsequent executions.
    pub fn set_memory_limit(&self, limit: usize) {
        self.runtime.set_memory_limit(limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluates_string_expressions() {
        let mut rt = JsRuntime::new(0).unwrap();
        let out = rt.eval("JSON.stringify({n: 1 + 2})").unwrap();
        assert_eq!(out, r#"{"n":3}"#);
    }

    #[test]
    fn syntax_errors_surface_as_execution_errors() {
        let mut rt = JsRuntime::new(0).unwrap();
        let err = rt.eval("this is not javascript").unwrap_err();
        assert!(matches!(err, Error::Execution { .. }));
    }

    #[test]
    fn raised_interrupt_stops_a_busy_loop() {
        let mut rt = JsRuntime::new(0).unwrap();
        rt.interrupt_flag().store(true, Ordering::Relaxed);
        let err = rt.eval("while (true) {} 'unreachable'");
        assert!(err.is_err());

        rt.clear_interrupt();
        assert_eq!(rt.eval("'recovered'").unwrap(), "recovered");
    }

    #[test]
    fn cleared_globals_are_gone() {
        let mut rt = JsRuntime::new(0).unwrap();
        rt.eval_discard("globalThis.leftover = 42;").unwrap();
        rt.clear_globals(&["leftover"]);
        let out = rt.eval("String(typeof leftover)").unwrap();
        assert_eq!(out, "undefined");
    }
}
