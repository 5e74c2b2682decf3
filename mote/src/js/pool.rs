//! A bounded pool of interruptible JS runtimes.
//!
//! Runtime cold-start is the dominant cost of small tool executions, so
//! instances are pooled and reused. Borrowers must return runtimes through
//! [`RuntimePool::release`]; released instances are scrubbed of injected
//! globals and pending interrupts before the next borrower sees them.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::runtime::JsRuntime;
use super::sandbox::INJECTED_GLOBALS;

/// How often the background task sweeps expired idle instances.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Pool sizing and timing configuration.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Maximum live runtimes, pooled plus borrowed.
    pub max_size: usize,
    /// Idle instances older than this are evicted.
    pub idle_timeout: Duration,
    /// How long an acquire blocks before failing.
    pub acquire_timeout: Duration,
    /// Per-runtime memory bound in bytes; zero disables the bound.
    pub memory_limit: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 5,
            idle_timeout: Duration::from_secs(300),
            acquire_timeout: Duration::from_secs(5),
            memory_limit: 64 * 1024 * 1024,
        }
    }
}

/// The runtime pool.
pub struct RuntimePool {
    config: PoolConfig,
    tx: mpsc::Sender<JsRuntime>,
    rx: Mutex<mpsc::Receiver<JsRuntime>>,
    /// Count of existing instances, pooled plus borrowed.
    live: AtomicUsize,
    /// Count of currently borrowed instances.
    active: AtomicUsize,
    closed: CancellationToken,
    cleanup: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RuntimePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimePool")
            .field("config", &self.config)
            .field("live", &self.live.load(Ordering::Relaxed))
            .field("active", &self.active.load(Ordering::Relaxed))
            .field("closed", &self.closed.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl RuntimePool {
    /// Create a pool and start its background cleanup task.
    #[must_use]
    pub fn new(config: PoolConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.max_size.max(1));
        let pool = Arc::new(Self {
            config,
            tx,
            rx: Mutex::new(rx),
            live: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            closed: CancellationToken::new(),
            cleanup: std::sync::Mutex::new(None),
        });

        let task = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move {
                let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        () = pool.closed.cancelled() => break,
                        _ = ticker.tick() => pool.sweep_expired().await,
                    }
                }
            }
        });
        *pool.cleanup.lock().expect("cleanup lock poisoned") = Some(task);

        pool
    }

    /// Borrow a runtime.
    ///
    /// Takes a pooled instance when one is ready, mints a fresh one while
    /// below the size bound, and otherwise blocks until a release or the
    /// acquire deadline.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<JsRuntime> {
        if self.closed.is_cancelled() {
            return Err(Error::resource_exhausted("runtime pool", "pool is closed"));
        }

        // Fast path: a pooled, non-expired instance.
        {
            let mut rx = self.rx.lock().await;
            while let Ok(rt) = rx.try_recv() {
                if rt.is_expired(self.config.idle_timeout) {
                    self.live.fetch_sub(1, Ordering::AcqRel);
                    continue;
                }
                self.active.fetch_add(1, Ordering::AcqRel);
                return Ok(rt);
            }
        }

        // Mint while below the bound.
        loop {
            let live = self.live.load(Ordering::Acquire);
            if live >= self.config.max_size {
                break;
            }
            if self
                .live
                .compare_exchange(live, live + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                debug!(live = live + 1, "Minting JS runtime");
                return match JsRuntime::new(self.config.memory_limit) {
                    Ok(rt) => {
                        self.active.fetch_add(1, Ordering::AcqRel);
                        Ok(rt)
                    }
                    Err(e) => {
                        self.live.fetch_sub(1, Ordering::AcqRel);
                        Err(e)
                    }
                };
            }
        }

        // Saturated: wait for a release or the deadline.
        let deadline = tokio::time::sleep(self.config.acquire_timeout);
        tokio::pin!(deadline);
        let mut rx = self.rx.lock().await;
        loop {
            tokio::select! {
                () = &mut deadline => {
                    return Err(Error::resource_exhausted(
                        "runtime pool",
                        format!(
                            "no runtime available within {:?} (max {})",
                            self.config.acquire_timeout, self.config.max_size
                        ),
                    ));
                }
                () = cancel.cancelled() => {
                    return Err(Error::resource_exhausted(
                        "runtime pool",
                        "cancelled while waiting for a runtime",
                    ));
                }
                () = self.closed.cancelled() => {
                    return Err(Error::resource_exhausted("runtime pool", "pool is closed"));
                }
                rt = rx.recv() => {
                    match rt {
                        Some(rt) if rt.is_expired(self.config.idle_timeout) => {
                            // Replace the stale instance in place; its live
                            // slot transfers to the replacement.
                            drop(rt);
                            let fresh = JsRuntime::new(self.config.memory_limit);
                            return match fresh {
                                Ok(rt) => {
                                    self.active.fetch_add(1, Ordering::AcqRel);
                                    Ok(rt)
                                }
                                Err(e) => {
                                    self.live.fetch_sub(1, Ordering::AcqRel);
                                    Err(e)
                                }
                            };
                        }
                        Some(rt) => {
                            self.active.fetch_add(1, Ordering::AcqRel);
                            return Ok(rt);
                        }
                        None => {
                            return Err(Error::resource_exhausted("runtime pool", "pool is closed"));
                        }
                    }
                }
            }
        }
    }

    /// Return a borrowed runtime.
    ///
    /// The instance is scrubbed (sandbox globals, pending interrupts) and
    /// put back; when the pool is full or closed it is discarded instead.
    pub async fn release(&self, mut rt: JsRuntime) {
        self.active.fetch_sub(1, Ordering::AcqRel);

        rt.clear_globals(INJECTED_GLOBALS);
        rt.clear_interrupt();
        rt.touch();

        if self.closed.is_cancelled() {
            self.live.fetch_sub(1, Ordering::AcqRel);
            return;
        }

        if self.tx.try_send(rt).is_err() {
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Count of existing instances, pooled plus borrowed.
    #[must_use]
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Count of currently borrowed instances.
    #[must_use]
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Drain expired idle instances and re-seed the rest.
    async fn sweep_expired(&self) {
        let mut rx = self.rx.lock().await;
        let mut keep = Vec::new();
        while let Ok(rt) = rx.try_recv() {
            if rt.is_expired(self.config.idle_timeout) {
                self.live.fetch_sub(1, Ordering::AcqRel);
            } else {
                keep.push(rt);
            }
        }
        drop(rx);
        for rt in keep {
            if self.tx.try_send(rt).is_err() {
                self.live.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }

    /// Close the pool. Idempotent; subsequent acquires fail immediately.
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();

        let mut rx = self.rx.lock().await;
        while let Ok(rt) = rx.try_recv() {
            drop(rt);
            self.live.fetch_sub(1, Ordering::AcqRel);
        }
        drop(rx);

        let task = self.cleanup.lock().expect("cleanup lock poisoned").take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Pool cleanup task join failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(max_size: usize, acquire_ms: u64) -> Arc<RuntimePool> {
        RuntimePool::new(PoolConfig {
            max_size,
            idle_timeout: Duration::from_secs(300),
            acquire_timeout: Duration::from_millis(acquire_ms),
            memory_limit: 0,
        })
    }

    #[tokio::test]
    async fn acquire_reuses_released_instances() {
        let pool = small_pool(2, 100);
        let cancel = CancellationToken::new();

        let rt = pool.acquire(&cancel).await.unwrap();
        assert_eq!(pool.live(), 1);
        assert_eq!(pool.active(), 1);

        pool.release(rt).await;
        assert_eq!(pool.active(), 0);

        let _rt = pool.acquire(&cancel).await.unwrap();
        assert_eq!(pool.live(), 1);
    }

    #[tokio::test]
    async fn saturated_pool_times_out() {
        let pool = small_pool(1, 50);
        let cancel = CancellationToken::new();

        let held = pool.acquire(&cancel).await.unwrap();
        let err = pool.acquire(&cancel).await.unwrap_err();
        assert!(err.to_string().contains("runtime pool"));

        pool.release(held).await;
    }

    #[tokio::test]
    async fn blocked_acquire_wakes_on_release() {
        let pool = small_pool(1, 2_000);
        let cancel = CancellationToken::new();

        let held = pool.acquire(&cancel).await.unwrap();
        let waiter = tokio::spawn({
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            async move { pool.acquire(&cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.release(held).await;

        let rt = waiter.await.unwrap().unwrap();
        pool.release(rt).await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_later_acquires() {
        let pool = small_pool(2, 50);
        pool.close().await;
        pool.close().await;

        let err = pool.acquire(&CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("closed"));
    }

    #[tokio::test]
    async fn released_runtime_is_scrubbed() {
        let pool = small_pool(1, 100);
        let cancel = CancellationToken::new();

        let mut rt = pool.acquire(&cancel).await.unwrap();
        rt.eval_discard("globalThis.mote = {leak: true};").unwrap();
        rt.interrupt_flag().store(true, std::sync::atomic::Ordering::Relaxed);
        pool.release(rt).await;

        let mut rt = pool.acquire(&cancel).await.unwrap();
        assert_eq!(rt.eval("String(typeof mote)").unwrap(), "undefined");
        pool.release(rt).await;
    }
}
