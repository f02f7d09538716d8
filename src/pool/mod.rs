pub mod histogram;
pub mod report;

pub use histogram::{HistogramSnapshot, WaitHistogram};
pub use report::{ConnPoolStats, ConnectionCounts, ExecutorPoolMetrics, PoolSummary};

use crate::error::ShardError;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

const GAUGE_BITS: u32 = 21;
const GAUGE_MASK: u64 = (1 << GAUGE_BITS) - 1;

/// In-use, available and refreshing connections of one sub-pool, packed
/// into one word so a single load sees all three consistently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Gauges {
    pub in_use: u64,
    pub available: u64,
    pub refreshing: u64,
}

impl Gauges {
    fn unpack(word: u64) -> Self {
        Self {
            in_use: word & GAUGE_MASK,
            available: (word >> GAUGE_BITS) & GAUGE_MASK,
            refreshing: (word >> (2 * GAUGE_BITS)) & GAUGE_MASK,
        }
    }

    fn pack(self) -> Option<u64> {
        if self.in_use > GAUGE_MASK || self.available > GAUGE_MASK || self.refreshing > GAUGE_MASK {
            return None;
        }
        Some(self.in_use | (self.available << GAUGE_BITS) | (self.refreshing << (2 * GAUGE_BITS)))
    }

    pub fn live(self) -> u64 {
        self.in_use + self.available + self.refreshing
    }
}

/// Counters of one `(host, pool)` pair.
#[derive(Debug, Default)]
struct SubPool {
    gauges: AtomicU64,
    /// Connections counted against the hard cap, reserved before creation.
    reserved: AtomicU64,
    created: AtomicU64,
    refreshed: AtomicU64,
    was_never_used: AtomicU64,
    scheduled: AtomicU64,
    executed: AtomicU64,
    queue_wait_micros: AtomicU64,
    run_micros: AtomicU64,
    acquisition_requests: AtomicU64,
    acquisition_wait_millis: AtomicU64,
    wait_times: WaitHistogram,
}

impl SubPool {
    fn transition(&self, f: impl Fn(Gauges) -> Option<Gauges>) -> bool {
        self.gauges
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |word| {
                f(Gauges::unpack(word)).and_then(Gauges::pack)
            })
            .is_ok()
    }

    fn reserve(&self, cap: Option<u64>) -> bool {
        self.reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| {
                cap.is_none_or(|cap| r < cap).then_some(r + 1)
            })
            .is_ok()
    }

    fn release_reservation(&self) {
        let _ = self
            .reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| r.checked_sub(1));
    }

    /// Gauges are read before `created`, and `created` is bumped before a
    /// gauge grows, so the sum of the gauges never exceeds `created`.
    fn snapshot(&self) -> report::SubPoolSnapshot {
        let gauges = Gauges::unpack(self.gauges.load(Ordering::SeqCst));
        report::SubPoolSnapshot {
            gauges,
            created: self.created.load(Ordering::SeqCst),
            refreshed: self.refreshed.load(Ordering::Relaxed),
            was_never_used: self.was_never_used.load(Ordering::Relaxed),
            scheduled: self.scheduled.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            queue_wait_micros: self.queue_wait_micros.load(Ordering::Relaxed),
            run_micros: self.run_micros.load(Ordering::Relaxed),
            acquisition_requests: self.acquisition_requests.load(Ordering::Relaxed),
            acquisition_wait_millis: self.acquisition_wait_millis.load(Ordering::Relaxed),
            wait_times: self.wait_times.snapshot(),
        }
    }
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Connection lifecycle accounting for every host and pool a router or
/// shard talks to. Updates are lock-free once a sub-pool exists.
#[derive(Debug, Default)]
pub struct PoolAccountant {
    pools: RwLock<BTreeMap<(String, String), Arc<SubPool>>>,
    hard_cap: Option<u64>,
}

impl PoolAccountant {
    pub fn new(hard_cap: Option<u64>) -> Self {
        Self {
            pools: RwLock::new(BTreeMap::new()),
            hard_cap,
        }
    }

    fn sub(&self, host: &str, pool: &str) -> Arc<SubPool> {
        let key = (host.to_string(), pool.to_string());
        if let Some(sub) = self.pools.read().get(&key) {
            return Arc::clone(sub);
        }
        Arc::clone(self.pools.write().entry(key).or_default())
    }

    fn exhausted(host: &str, pool: &str) -> ShardError {
        ShardError::ConnectionPoolExhausted {
            host: host.to_string(),
            pool: pool.to_string(),
        }
    }

    fn illegal(what: &str, host: &str, pool: &str) -> ShardError {
        ShardError::Validation(format!("{what} on {host} pool '{pool}'"))
    }

    /// Opens an idle connection.
    pub fn connection_created(&self, host: &str, pool: &str) -> Result<(), ShardError> {
        let sub = self.sub(host, pool);
        if !sub.reserve(self.hard_cap) {
            return Err(Self::exhausted(host, pool));
        }
        sub.created.fetch_add(1, Ordering::SeqCst);
        if !sub.transition(|g| Some(Gauges { available: g.available + 1, ..g })) {
            sub.release_reservation();
            return Err(Self::exhausted(host, pool));
        }
        Ok(())
    }

    /// Hands a connection to a request that waited `wait` for it, reusing an
    /// idle connection or opening a new one.
    pub fn record_acquisition(&self, host: &str, pool: &str, wait: Duration) -> Result<(), ShardError> {
        let sub = self.sub(host, pool);
        sub.acquisition_requests.fetch_add(1, Ordering::Relaxed);
        sub.acquisition_wait_millis.fetch_add(millis(wait), Ordering::Relaxed);
        sub.wait_times.record(wait);
        let reused = sub.transition(|g| {
            (g.available > 0).then(|| Gauges {
                in_use: g.in_use + 1,
                available: g.available - 1,
                ..g
            })
        });
        if reused {
            return Ok(());
        }
        if !sub.reserve(self.hard_cap) {
            warn!(host, pool, cap = ?self.hard_cap, "connection pool hard cap reached");
            return Err(Self::exhausted(host, pool));
        }
        sub.created.fetch_add(1, Ordering::SeqCst);
        if !sub.transition(|g| Some(Gauges { in_use: g.in_use + 1, ..g })) {
            sub.release_reservation();
            return Err(Self::exhausted(host, pool));
        }
        Ok(())
    }

    /// Returns a connection after a remote operation that ran for `run`.
    pub fn connection_returned(&self, host: &str, pool: &str, run: Duration) -> Result<(), ShardError> {
        let sub = self.sub(host, pool);
        let moved = sub.transition(|g| {
            (g.in_use > 0).then(|| Gauges {
                in_use: g.in_use - 1,
                available: g.available + 1,
                ..g
            })
        });
        if !moved {
            return Err(Self::illegal("no connection in use", host, pool));
        }
        sub.executed.fetch_add(1, Ordering::Relaxed);
        sub.run_micros.fetch_add(micros(run), Ordering::Relaxed);
        Ok(())
    }

    /// Starts refreshing an idle connection.
    pub fn record_refresh(&self, host: &str, pool: &str) -> Result<(), ShardError> {
        let sub = self.sub(host, pool);
        let moved = sub.transition(|g| {
            (g.available > 0).then(|| Gauges {
                available: g.available - 1,
                refreshing: g.refreshing + 1,
                ..g
            })
        });
        if !moved {
            return Err(Self::illegal("no idle connection to refresh", host, pool));
        }
        Ok(())
    }

    /// Ends a refresh; a failed refresh closes the connection.
    pub fn refresh_finished(&self, host: &str, pool: &str, ok: bool) -> Result<(), ShardError> {
        let sub = self.sub(host, pool);
        let moved = sub.transition(|g| {
            (g.refreshing > 0).then(|| Gauges {
                refreshing: g.refreshing - 1,
                available: if ok { g.available + 1 } else { g.available },
                ..g
            })
        });
        if !moved {
            return Err(Self::illegal("no connection refreshing", host, pool));
        }
        if ok {
            sub.refreshed.fetch_add(1, Ordering::Relaxed);
        } else {
            sub.release_reservation();
        }
        Ok(())
    }

    /// Closes an idle connection.
    pub fn connection_dropped(&self, host: &str, pool: &str, ever_used: bool) -> Result<(), ShardError> {
        let sub = self.sub(host, pool);
        let moved = sub.transition(|g| {
            (g.available > 0).then(|| Gauges {
                available: g.available - 1,
                ..g
            })
        });
        if !moved {
            return Err(Self::illegal("no idle connection to drop", host, pool));
        }
        sub.release_reservation();
        if !ever_used {
            sub.was_never_used.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Counts a task queued on the executor for `host` that waited
    /// `queue_wait` before running.
    pub fn record_scheduled(&self, host: &str, pool: &str, queue_wait: Duration) {
        let sub = self.sub(host, pool);
        sub.scheduled.fetch_add(1, Ordering::Relaxed);
        sub.queue_wait_micros.fetch_add(micros(queue_wait), Ordering::Relaxed);
    }

    pub fn gauges(&self, host: &str, pool: &str) -> Gauges {
        Gauges::unpack(self.sub(host, pool).gauges.load(Ordering::SeqCst))
    }

    /// `connPoolStats` view; fails if any conservation invariant is broken.
    pub fn snapshot(&self) -> Result<ConnPoolStats, ShardError> {
        let subs: Vec<((String, String), Arc<SubPool>)> = self
            .pools
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        let snapshots = subs
            .iter()
            .map(|((host, pool), sub)| (host.clone(), pool.clone(), sub.snapshot()))
            .collect::<Vec<_>>();
        let stats = ConnPoolStats::aggregate(&snapshots);
        stats.verify()?;
        Ok(stats)
    }

    /// Task executor counters per pool.
    pub fn executor_metrics(&self) -> Result<BTreeMap<String, ExecutorPoolMetrics>, ShardError> {
        Ok(self
            .snapshot()?
            .pools
            .into_iter()
            .map(|(name, summary)| (name, ExecutorPoolMetrics::from(&summary)))
            .collect())
    }
}

/// An acquired connection that reports itself returned when dropped.
pub struct ConnectionLease {
    accountant: Arc<PoolAccountant>,
    host: String,
    pool: String,
    started: std::time::Instant,
}

impl ConnectionLease {
    pub fn acquire(
        accountant: &Arc<PoolAccountant>,
        host: &str,
        pool: &str,
        wait: Duration,
    ) -> Result<Self, ShardError> {
        accountant.record_scheduled(host, pool, wait);
        accountant.record_acquisition(host, pool, wait)?;
        Ok(Self {
            accountant: Arc::clone(accountant),
            host: host.to_string(),
            pool: pool.to_string(),
            started: std::time::Instant::now(),
        })
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if let Err(err) =
            self.accountant
                .connection_returned(&self.host, &self.pool, self.started.elapsed())
        {
            warn!(host = %self.host, pool = %self.pool, error = %err, "connection return not recorded");
        }
    }
}
