//! In-process bucket store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use crate::error::BackendError;

use super::backend::{BucketSnapshot, RateLimiterBackend};
use super::bucket::{BucketConfig, BucketState, Decision};
use super::identifier::Identifier;

/// Default time between idle sweeps.
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Default time a bucket may sit untouched before it is evicted.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Tokio intervals cannot tick with a zero period.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

type BucketMap = HashMap<String, Arc<Mutex<BucketState>>>;

/// When idle buckets are swept out of memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// How often the janitor runs
    pub sweep_interval: Duration,
    /// Buckets not refilled within this window are removed
    pub idle_timeout: Duration,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

struct Janitor {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Token buckets held in process memory.
///
/// The map lock is only taken to find, insert or evict a bucket; the
/// refill/consume step runs under the bucket's own mutex, so callers with
/// different identifiers never wait on each other.
pub struct MemoryBackend {
    config: BucketConfig,
    buckets: Arc<RwLock<BucketMap>>,
    idle_timeout: chrono::Duration,
    janitor: Mutex<Option<Janitor>>,
}

impl MemoryBackend {
    /// Create the store and start its eviction janitor.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: BucketConfig, policy: EvictionPolicy) -> Self {
        let buckets: Arc<RwLock<BucketMap>> = Arc::new(RwLock::new(HashMap::new()));
        let idle_timeout = chrono::Duration::from_std(policy.idle_timeout)
            .unwrap_or_else(|_| chrono::Duration::weeks(52));

        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(run_janitor(
            Arc::clone(&buckets),
            policy.sweep_interval.max(MIN_SWEEP_INTERVAL),
            idle_timeout,
            shutdown_rx,
        ));

        info!(
            capacity = config.capacity(),
            refill_rate = config.refill_rate_per_second(),
            sweep_interval = ?policy.sweep_interval,
            idle_timeout = ?policy.idle_timeout,
            "Memory bucket store started"
        );

        Self {
            config,
            buckets,
            idle_timeout,
            janitor: Mutex::new(Some(Janitor { shutdown, handle })),
        }
    }

    /// Get the bucket for an identifier, creating a full one on first use.
    fn bucket(&self, identifier: &Identifier) -> Arc<Mutex<BucketState>> {
        if let Some(bucket) = self.buckets.read().get(identifier.as_str()) {
            return Arc::clone(bucket);
        }

        // Another caller may have created it between the two locks
        let mut buckets = self.buckets.write();
        let bucket = buckets
            .entry(identifier.as_str().to_string())
            .or_insert_with(|| {
                debug!(identifier = %identifier, "Creating token bucket");
                Arc::new(Mutex::new(BucketState::full(&self.config, Utc::now())))
            });
        Arc::clone(bucket)
    }

    /// Remove every bucket idle for longer than the idle timeout as of `now`.
    ///
    /// Returns the number of buckets removed. The janitor calls this on
    /// every tick.
    pub fn evict_idle(&self, now: chrono::DateTime<Utc>) -> usize {
        evict_idle(&self.buckets, self.idle_timeout, now)
    }

    /// Get the number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }
}

#[async_trait]
impl RateLimiterBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn config(&self) -> &BucketConfig {
        &self.config
    }

    async fn allow(&self, identifier: &Identifier, cost: u32) -> Result<Decision, BackendError> {
        let bucket = self.bucket(identifier);
        let mut state = bucket.lock();
        let decision = state.try_consume(&self.config, Utc::now(), cost);

        trace!(
            identifier = %identifier,
            cost = cost,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Memory bucket checked"
        );

        Ok(decision)
    }

    async fn reset(&self, identifier: &Identifier) -> Result<(), BackendError> {
        if self.buckets.write().remove(identifier.as_str()).is_some() {
            debug!(identifier = %identifier, "Token bucket reset");
        }
        Ok(())
    }

    async fn inspect(&self, identifier: &Identifier) -> Result<BucketSnapshot, BackendError> {
        let now = Utc::now();
        let bucket = self.buckets.read().get(identifier.as_str()).cloned();

        let (tokens, last_refill_at) = match bucket {
            Some(bucket) => {
                let state = bucket.lock();
                (state.refilled(&self.config, now), state.last_refill_at)
            }
            None => (self.config.capacity() as f64, now),
        };

        Ok(BucketSnapshot {
            tokens,
            last_refill_at,
            capacity: self.config.capacity(),
            refill_rate_per_second: self.config.refill_rate_per_second(),
        })
    }

    async fn shutdown(&self) {
        let janitor = self.janitor.lock().take();
        if let Some(janitor) = janitor {
            let _ = janitor.shutdown.send(());
            let _ = janitor.handle.await;
            info!("Memory bucket store janitor stopped");
        }
    }
}

impl Drop for MemoryBackend {
    fn drop(&mut self) {
        if let Some(janitor) = self.janitor.get_mut().take() {
            janitor.handle.abort();
        }
    }
}

async fn run_janitor(
    buckets: Arc<RwLock<BucketMap>>,
    sweep_interval: Duration,
    idle_timeout: chrono::Duration,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let evicted = evict_idle(&buckets, idle_timeout, Utc::now());
                if evicted > 0 {
                    debug!(evicted = evicted, "Evicted idle token buckets");
                }
            }
            _ = &mut shutdown => break,
        }
    }
}

fn evict_idle(
    buckets: &RwLock<BucketMap>,
    idle_timeout: chrono::Duration,
    now: chrono::DateTime<Utc>,
) -> usize {
    let mut buckets = buckets.write();
    let before = buckets.len();
    buckets.retain(|_, bucket| now - bucket.lock().last_refill_at <= idle_timeout);
    before - buckets.len()
}
