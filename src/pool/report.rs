use super::Gauges;
use super::histogram::HistogramSnapshot;
use crate::error::ShardError;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default)]
pub(super) struct SubPoolSnapshot {
    pub gauges: Gauges,
    pub created: u64,
    pub refreshed: u64,
    pub was_never_used: u64,
    pub scheduled: u64,
    pub executed: u64,
    pub queue_wait_micros: u64,
    pub run_micros: u64,
    pub acquisition_requests: u64,
    pub acquisition_wait_millis: u64,
    pub wait_times: HistogramSnapshot,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCounts {
    pub in_use: u64,
    pub available: u64,
    pub created: u64,
    pub refreshing: u64,
    pub refreshed: u64,
    pub was_never_used: u64,
}

impl ConnectionCounts {
    fn add(&mut self, s: &SubPoolSnapshot) {
        self.in_use += s.gauges.in_use;
        self.available += s.gauges.available;
        self.created += s.created;
        self.refreshing += s.gauges.refreshing;
        self.refreshed += s.refreshed;
        self.was_never_used += s.was_never_used;
    }

    fn conserved(&self) -> bool {
        self.in_use + self.available <= self.created
            && self.in_use + self.available + self.refreshing <= self.created
    }
}

/// One host (across its pools) or one pool (across its hosts).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSummary {
    #[serde(flatten)]
    pub counts: ConnectionCounts,
    pub scheduled: u64,
    pub executed: u64,
    pub average_wait_time_micros: u64,
    pub average_run_time_micros: u64,
    pub connection_acquisition_requests: u64,
    pub connection_acquisition_wait_time_millis: u64,
    pub acquisition_wait_times: HistogramSnapshot,
    /// Breakdown by the other dimension: pools of a host, hosts of a pool.
    pub pool_state: BTreeMap<String, ConnectionCounts>,
    #[serde(skip)]
    queue_wait_micros: u64,
    #[serde(skip)]
    run_micros: u64,
}

impl PoolSummary {
    fn add(&mut self, other_dimension: &str, s: &SubPoolSnapshot) {
        self.counts.add(s);
        self.scheduled += s.scheduled;
        self.executed += s.executed;
        self.queue_wait_micros += s.queue_wait_micros;
        self.run_micros += s.run_micros;
        self.connection_acquisition_requests += s.acquisition_requests;
        self.connection_acquisition_wait_time_millis += s.acquisition_wait_millis;
        self.acquisition_wait_times.add(&s.wait_times);
        self.pool_state
            .entry(other_dimension.to_string())
            .or_default()
            .add(s);
    }

    fn finish(&mut self) {
        self.average_wait_time_micros = average(self.queue_wait_micros, self.scheduled);
        self.average_run_time_micros = average(self.run_micros, self.executed);
    }
}

fn average(total: u64, count: u64) -> u64 {
    if count == 0 { 0 } else { total / count }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorPoolMetrics {
    pub scheduled: u64,
    pub executed: u64,
    pub average_wait_time_micros: u64,
    pub average_run_time_micros: u64,
}

impl From<&PoolSummary> for ExecutorPoolMetrics {
    fn from(s: &PoolSummary) -> Self {
        Self {
            scheduled: s.scheduled,
            executed: s.executed,
            average_wait_time_micros: s.average_wait_time_micros,
            average_run_time_micros: s.average_run_time_micros,
        }
    }
}

/// The `connPoolStats` report.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnPoolStats {
    pub hosts: BTreeMap<String, PoolSummary>,
    pub pools: BTreeMap<String, PoolSummary>,
    pub total_in_use: u64,
    pub total_available: u64,
    pub total_created: u64,
    pub total_refreshing: u64,
    pub total_refreshed: u64,
    pub total_was_never_used: u64,
    pub total_scheduled: u64,
    pub total_executed: u64,
    pub acquisition_wait_times: HistogramSnapshot,
    pub total_connection_acquisition_requests: u64,
    pub total_connection_acquisition_wait_time_millis: u64,
}

impl ConnPoolStats {
    pub(super) fn aggregate(subs: &[(String, String, SubPoolSnapshot)]) -> Self {
        let mut stats = ConnPoolStats::default();
        for (host, pool, s) in subs {
            stats.hosts.entry(host.clone()).or_default().add(pool, s);
            stats.pools.entry(pool.clone()).or_default().add(host, s);
            stats.total_in_use += s.gauges.in_use;
            stats.total_available += s.gauges.available;
            stats.total_created += s.created;
            stats.total_refreshing += s.gauges.refreshing;
            stats.total_refreshed += s.refreshed;
            stats.total_was_never_used += s.was_never_used;
            stats.total_scheduled += s.scheduled;
            stats.total_executed += s.executed;
            stats.acquisition_wait_times.add(&s.wait_times);
            stats.total_connection_acquisition_requests += s.acquisition_requests;
            stats.total_connection_acquisition_wait_time_millis += s.acquisition_wait_millis;
        }
        for summary in stats.hosts.values_mut().chain(stats.pools.values_mut()) {
            summary.finish();
        }
        stats
    }

    fn totals(&self) -> ConnectionCounts {
        ConnectionCounts {
            in_use: self.total_in_use,
            available: self.total_available,
            created: self.total_created,
            refreshing: self.total_refreshing,
            refreshed: self.total_refreshed,
            was_never_used: self.total_was_never_used,
        }
    }

    /// Checks the conservation invariants and that hosts and pools each sum
    /// to the top level.
    pub fn verify(&self) -> Result<(), ShardError> {
        let broken = |message: String| Err(ShardError::IntegrityError { message });
        if !self.totals().conserved() {
            return broken(format!("pool totals not conserved: {:?}", self.totals()));
        }
        for (dimension, parents) in [("hosts", &self.hosts), ("pools", &self.pools)] {
            let mut counts = ConnectionCounts::default();
            let mut histogram = HistogramSnapshot::default();
            let (mut executed, mut requests) = (0, 0);
            for (name, summary) in parents {
                if !summary.counts.conserved() {
                    return broken(format!("{dimension}.{name} counts not conserved"));
                }
                if summary.pool_state.values().any(|child| !child.conserved()) {
                    return broken(format!("{dimension}.{name}.poolState not conserved"));
                }
                histogram.add(&summary.acquisition_wait_times);
                counts.in_use += summary.counts.in_use;
                counts.available += summary.counts.available;
                counts.created += summary.counts.created;
                counts.refreshing += summary.counts.refreshing;
                counts.refreshed += summary.counts.refreshed;
                counts.was_never_used += summary.counts.was_never_used;
                executed += summary.executed;
                requests += summary.connection_acquisition_requests;
            }
            if counts != self.totals() {
                return broken(format!("{dimension} do not sum to the totals"));
            }
            if executed != self.total_executed || requests != self.total_connection_acquisition_requests {
                return broken(format!("{dimension} executed or request counts do not sum to the totals"));
            }
            if histogram != self.acquisition_wait_times {
                return broken(format!("{dimension} wait-time buckets do not sum to the totals"));
            }
        }
        Ok(())
    }
}
