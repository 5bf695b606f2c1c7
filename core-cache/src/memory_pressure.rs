//! Debounced reaction to host low-memory signals
//!
//! A burst of signals inside the debounce window collapses into one critical
//! trim of every registered store. Stores are held weakly and a dropped store
//! is simply skipped.

use crate::store::{CacheStore, WeakCacheStore};
use bridge_traits::{MemoryPressureLevel, MemoryPressureMonitor};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct HandlerInner {
    stores: Mutex<Vec<WeakCacheStore>>,
    trims: AtomicU64,
}

impl HandlerInner {
    fn trim_all(&self, level: MemoryPressureLevel) -> usize {
        let stores: Vec<CacheStore> = {
            let mut stores = self.stores.lock();
            stores.retain(|weak| weak.upgrade().is_some());
            stores.iter().filter_map(WeakCacheStore::upgrade).collect()
        };

        let removed: usize = stores.iter().map(|store| store.trim(true)).sum();
        self.trims.fetch_add(1, Ordering::Relaxed);
        info!(?level, stores = stores.len(), removed, "Memory pressure trim");
        removed
    }
}

/// Collects memory pressure signals and trims registered stores once the
/// signals stop arriving for the debounce window.
///
/// Must be created inside a Tokio runtime. Dropping the handler stops its
/// background tasks.
pub struct MemoryPressureHandler {
    inner: Arc<HandlerInner>,
    signals: mpsc::UnboundedSender<MemoryPressureLevel>,
    cancel: CancellationToken,
}

impl MemoryPressureHandler {
    pub fn new(debounce: Duration) -> Self {
        let inner = Arc::new(HandlerInner {
            stores: Mutex::new(Vec::new()),
            trims: AtomicU64::new(0),
        });
        let (signals, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(run_debounce(
            Arc::clone(&inner),
            rx,
            debounce,
            cancel.clone(),
        ));

        Self {
            inner,
            signals,
            cancel,
        }
    }

    pub fn register(&self, store: &CacheStore) {
        self.inner.stores.lock().push(store.downgrade());
    }

    /// Report a low-memory signal. Restarts the debounce window.
    pub fn signal(&self, level: MemoryPressureLevel) {
        debug!(?level, "Memory pressure signal received");
        if self.signals.send(level).is_err() {
            warn!("Memory pressure handler has stopped");
        }
    }

    /// Forward every signal from `monitor` until the handler is dropped or
    /// the host stream ends.
    pub fn listen(&self, monitor: Arc<dyn MemoryPressureMonitor>) -> JoinHandle<()> {
        let signals = self.signals.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut stream = match monitor.subscribe().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "Memory pressure monitor unavailable");
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    level = stream.next() => match level {
                        Some(level) => {
                            if signals.send(level).is_err() {
                                break;
                            }
                        }
                        None => {
                            debug!("Memory pressure stream ended");
                            break;
                        }
                    },
                }
            }
        })
    }

    /// Number of trims performed so far.
    pub fn trim_count(&self) -> u64 {
        self.inner.trims.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for MemoryPressureHandler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_debounce(
    inner: Arc<HandlerInner>,
    mut rx: mpsc::UnboundedReceiver<MemoryPressureLevel>,
    debounce: Duration,
    cancel: CancellationToken,
) {
    loop {
        let mut level = tokio::select! {
            _ = cancel.cancelled() => return,
            signal = rx.recv() => match signal {
                Some(level) => level,
                None => return,
            },
        };

        let window = tokio::time::sleep(debounce);
        tokio::pin!(window);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = &mut window => break,
                signal = rx.recv() => match signal {
                    Some(next) => {
                        level = level.max(next);
                        window.as_mut().reset(Instant::now() + debounce);
                    }
                    None => break,
                },
            }
        }

        inner.trim_all(level);
    }
}
