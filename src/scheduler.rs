//! Scheduler: owns the periodic background tasks (reconcile tick, cache
//! eviction, tunnel drift check). Generalizes the teacher's
//! `EcrController::provision_loop`/`cleanup_loop` pair (each its own
//! `tokio::spawn` + plain `tokio::time::interval` ticker) into an arbitrary
//! list of named tasks, adding `tokio_util::sync::CancellationToken` so the
//! whole set can be torn down together on shutdown instead of running forever.
//! See SPEC_FULL.md §4.9.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::BuildCache;
use crate::reconcile::Reconciler;

pub struct Scheduler {
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self { cancel: CancellationToken::new(), handles: Vec::new() }
    }

    /// Spawns a named periodic task. The task body runs once per tick and is
    /// never run concurrently with itself, since the loop awaits the body
    /// before ticking again.
    fn spawn_periodic<F, Fut>(&mut self, name: &'static str, period: Duration, mut body: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // first tick fires immediately; skip it so we wait a full period before starting
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!(task = name, "scheduler task stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        body().await;
                    }
                }
            }
        });
        self.handles.push(handle);
    }

    pub fn start_reconcile_loop(&mut self, reconciler: Arc<Reconciler>) {
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            reconciler.run(cancel).await;
        });
        self.handles.push(handle);
    }

    pub fn start_cache_eviction(&mut self, cache: Arc<BuildCache>, interval: Duration, max_age: Duration) {
        self.spawn_periodic("cache-eviction", interval, move || {
            let cache = Arc::clone(&cache);
            async move {
                let cutoff = chrono::Utc::now() - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::days(1));
                match cache.evict("", cutoff).await {
                    Ok(count) => tracing::info!(evicted = count, "build cache eviction complete"),
                    Err(e) => tracing::error!(error = %e, "build cache eviction failed"),
                }
            }
        });
    }

    /// Periodically re-applies each domain's tunnel ingress rule so config
    /// pushed out-of-band (e.g. via the tunnel provider's own console) drifts
    /// back in line. `check` is supplied by the caller since it needs a
    /// `DomainController` reference that this module doesn't otherwise depend on.
    pub fn start_tunnel_drift_check<F, Fut>(&mut self, interval: Duration, check: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        self.spawn_periodic("tunnel-drift-check", interval, check);
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "scheduler task panicked");
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
