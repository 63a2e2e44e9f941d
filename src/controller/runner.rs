//! Controller worker loop and the supervisor owning every worker
//!
//! A controller has one queue holding one constant key. Every informer it
//! reads wakes it by adding that key, so any burst of changes becomes a
//! single level-triggered `sync`. One worker per controller keeps syncs of
//! the same controller strictly sequential.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::controller::error::{BackoffConfig, Error, Result};
use crate::controller::informer::{Notifier, Subscription};
use crate::controller::queue::WorkQueue;
use crate::controller::retry::until_cancelled;
use crate::health::Metrics;

/// One level-triggered reconcile pass
#[async_trait]
pub trait Reconciler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Re-derive and apply the full desired state
    ///
    /// Permanent failures are reported through status and returned as `Ok`;
    /// an `Err` asks for a rate-limited retry.
    async fn sync(&self, token: &CancellationToken) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct ControllerSettings {
    /// The single key every notification enqueues
    pub queue_key: String,
    /// Periodic wake-up independent of notifications
    pub resync_interval: Duration,
    pub backoff: BackoffConfig,
    /// Interval between cache-sync checks at startup
    pub sync_poll_interval: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            queue_key: "instance".to_string(),
            resync_interval: Duration::from_secs(600),
            backoff: BackoffConfig::default(),
            sync_poll_interval: Duration::from_millis(100),
        }
    }
}

pub struct Controller {
    reconciler: Arc<dyn Reconciler>,
    notifiers: Vec<Arc<dyn Notifier>>,
    queue: WorkQueue<String>,
    settings: ControllerSettings,
    metrics: Option<Arc<Metrics>>,
}

impl Controller {
    pub fn new(
        reconciler: Arc<dyn Reconciler>,
        notifiers: Vec<Arc<dyn Notifier>>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            reconciler,
            notifiers,
            queue: WorkQueue::new(settings.backoff.clone()),
            settings,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &'static str {
        self.reconciler.name()
    }

    /// Handle to the controller's queue
    pub fn queue(&self) -> WorkQueue<String> {
        self.queue.clone()
    }

    fn subscribe(&self) -> Vec<Subscription> {
        self.notifiers
            .iter()
            .map(|notifier| {
                let queue = self.queue.clone();
                let key = self.settings.queue_key.clone();
                notifier.subscribe(Arc::new(move |_| queue.add(key.clone())))
            })
            .collect()
    }

    async fn wait_for_caches(&self, token: &CancellationToken) -> Result<()> {
        while !self.notifiers.iter().all(|n| n.has_synced()) {
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.settings.sync_poll_interval) => {}
            }
        }
        Ok(())
    }

    /// Run until `token` is cancelled
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let name = self.name();
        let key = self.settings.queue_key.clone();
        let _subscriptions = self.subscribe();

        info!(controller = %name, "waiting for caches to sync");
        match self.wait_for_caches(&token).await {
            Ok(()) => {}
            Err(Error::Cancelled) => return Ok(()),
            Err(e) => return Err(e),
        }
        info!(controller = %name, "caches synced, starting worker");
        self.queue.add(key.clone());

        let resync_queue = self.queue.clone();
        let resync_key = key.clone();
        let resync_interval = self.settings.resync_interval;
        let resync_token = token.clone();
        let resync = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + resync_interval, resync_interval);
            loop {
                tokio::select! {
                    _ = resync_token.cancelled() => break,
                    _ = ticker.tick() => resync_queue.add(resync_key.clone()),
                }
            }
        });

        let shutdown_queue = self.queue.clone();
        let shutdown_token = token.clone();
        tokio::spawn(async move {
            shutdown_token.cancelled().await;
            shutdown_queue.shutdown();
        });

        while let Some(key) = self.queue.get().await {
            if token.is_cancelled() {
                self.queue.done(&key);
                continue;
            }
            self.process(&key, &token).await;
            self.queue.done(&key);
        }

        resync.abort();
        info!(controller = %name, "worker stopped");
        Ok(())
    }

    async fn process(&self, key: &String, token: &CancellationToken) {
        let name = self.name();
        let start = Instant::now();
        let result = until_cancelled(token, self.reconciler.sync(token)).await;
        let elapsed = start.elapsed().as_secs_f64();

        if let Some(metrics) = &self.metrics {
            metrics.record_reconcile(name, elapsed);
        }

        match result {
            Ok(()) => {
                debug!(controller = %name, elapsed_secs = elapsed, "sync finished");
                self.queue.forget(key);
            }
            Err(Error::Cancelled) => {
                debug!(controller = %name, "sync cancelled");
                self.queue.forget(key);
            }
            Err(e) if e.is_retryable() => {
                let requeues = self.queue.num_requeues(key);
                warn!(controller = %name, error = %e, requeues, "sync failed, requeueing");
                if let Some(metrics) = &self.metrics {
                    metrics.record_error(name);
                    metrics.record_requeue(name);
                }
                self.queue.add_rate_limited(key.clone());
            }
            Err(e) => {
                error!(controller = %name, error = %e, "sync failed permanently");
                if let Some(metrics) = &self.metrics {
                    metrics.record_error(name);
                }
                self.queue.forget(key);
            }
        }
    }
}

/// Owns every worker task and the root cancellation token
pub struct Supervisor {
    token: CancellationToken,
    tasks: JoinSet<(&'static str, Result<()>)>,
    grace_period: Duration,
}

impl Supervisor {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: JoinSet::new(),
            grace_period,
        }
    }

    /// Root token; cancelling it stops every worker
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn a worker with its own child token
    pub fn spawn<F, Fut>(&mut self, name: &'static str, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let child = self.token.child_token();
        let fut = task(child);
        self.tasks.spawn(async move { (name, fut.await) });
    }

    pub fn spawn_controller(&mut self, controller: Controller) {
        let name = controller.name();
        self.spawn(name, move |token| controller.run(token));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run until `shutdown` resolves or a worker exits, then stop everything
    pub async fn run_until<S>(mut self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let mut first_failure = None;
        tokio::select! {
            _ = shutdown => info!("shutdown requested"),
            Some(joined) = self.tasks.join_next() => {
                first_failure = Self::report(joined).err();
                warn!("a worker exited early, stopping the rest");
            }
        }
        self.shutdown().await?;
        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Cancel every worker and wait for them, up to the grace period
    pub async fn shutdown(mut self) -> Result<()> {
        self.token.cancel();
        let grace_period = self.grace_period;
        let tasks = &mut self.tasks;
        let drain = async move {
            while let Some(joined) = tasks.join_next().await {
                let _ = Self::report(joined);
            }
        };
        if tokio::time::timeout(grace_period, drain).await.is_err() {
            warn!(remaining = self.tasks.len(), "workers did not stop in time, aborting");
            self.tasks.abort_all();
            return Err(Error::Timeout("supervisor shutdown".to_string()));
        }
        info!("all workers stopped");
        Ok(())
    }

    fn report(joined: std::result::Result<(&'static str, Result<()>), tokio::task::JoinError>) -> Result<()> {
        match joined {
            Ok((name, Ok(()))) => {
                info!(worker = %name, "worker finished");
                Ok(())
            }
            Ok((name, Err(e))) => {
                error!(worker = %name, error = %e, "worker failed");
                Err(e)
            }
            Err(e) => {
                error!(error = %e, "worker panicked");
                Err(Error::TransientError(format!("worker task failed: {}", e)))
            }
        }
    }
}
