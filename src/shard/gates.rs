use crate::document::{KeyRange, KeyValue};
use crate::error::ShardError;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{debug, info};

/// How a critical section ended, as seen by writes parked behind it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Pending,
    Committed,
    Aborted,
}

struct RaisedGate {
    range: KeyRange,
    generation: u64,
    outcome: watch::Sender<GateOutcome>,
}

#[derive(Default)]
struct NamespaceGate {
    raised: Option<RaisedGate>,
    next_generation: u64,
    /// In-flight writes by the generation they were admitted under.
    inflight: BTreeMap<u64, usize>,
}

impl NamespaceGate {
    fn blocks(&self, keys: &[KeyValue], key_known: bool) -> Option<watch::Receiver<GateOutcome>> {
        let gate = self.raised.as_ref()?;
        let hit = !key_known || keys.iter().any(|k| gate.range.contains(k));
        hit.then(|| gate.outcome.subscribe())
    }

    fn drained_before(&self, generation: u64) -> bool {
        self.inflight.range(..generation).all(|(_, n)| *n == 0)
    }
}

/// Per-namespace write admission for one shard.
///
/// A raised gate parks new writes to its range; writes admitted earlier are
/// counted so the critical section can wait for them to reach the oplog.
#[derive(Default)]
pub struct WriteGates {
    namespaces: Mutex<HashMap<String, NamespaceGate>>,
    drained: Notify,
}

/// Registration of one admitted write; dropping it marks the write finished.
pub struct InflightGuard {
    gates: Arc<WriteGates>,
    ns: String,
    generation: u64,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        {
            let mut namespaces = self.gates.namespaces.lock();
            if let Some(gate) = namespaces.get_mut(&self.ns)
                && let Some(count) = gate.inflight.get_mut(&self.generation)
            {
                *count -= 1;
                if *count == 0 {
                    gate.inflight.remove(&self.generation);
                }
            }
        }
        self.gates.drained.notify_waiters();
    }
}

pub enum Admission {
    Admitted(InflightGuard),
    Blocked(watch::Receiver<GateOutcome>),
}

impl WriteGates {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Admits the write unless a raised gate covers one of `keys`. A write
    /// whose key is unknown is parked by any raised gate on the namespace.
    pub fn try_admit(self: &Arc<Self>, ns: &str, keys: &[KeyValue], key_known: bool) -> Admission {
        let mut namespaces = self.namespaces.lock();
        let gate = namespaces.entry(ns.to_string()).or_default();
        if let Some(rx) = gate.blocks(keys, key_known) {
            return Admission::Blocked(rx);
        }
        let generation = gate.next_generation;
        *gate.inflight.entry(generation).or_default() += 1;
        Admission::Admitted(InflightGuard {
            gates: Arc::clone(self),
            ns: ns.to_string(),
            generation,
        })
    }

    /// Admits the write, parking it while a gate covers its keys. Parked
    /// writes give up with a retryable error at `deadline`.
    pub async fn admit(
        self: &Arc<Self>,
        ns: &str,
        keys: &[KeyValue],
        key_known: bool,
        deadline: Instant,
    ) -> Result<InflightGuard, ShardError> {
        loop {
            let mut rx = match self.try_admit(ns, keys, key_known) {
                Admission::Admitted(guard) => return Ok(guard),
                Admission::Blocked(rx) => rx,
            };
            debug!(ns, "write parked behind critical section");
            match tokio::time::timeout_at(deadline, rx.wait_for(|o| *o != GateOutcome::Pending)).await {
                Err(_) => {
                    return Err(ShardError::CriticalSectionTimeout { ns: ns.to_string() });
                }
                // Either resolved or the gate was dropped; re-check admission.
                Ok(_) => continue,
            }
        }
    }

    pub fn raise(&self, ns: &str, range: KeyRange) -> Result<u64, ShardError> {
        let mut namespaces = self.namespaces.lock();
        let gate = namespaces.entry(ns.to_string()).or_default();
        if let Some(existing) = &gate.raised {
            return Err(ShardError::ConflictingOperationInProgress(format!(
                "critical section on '{ns}' {} already held",
                existing.range
            )));
        }
        gate.next_generation += 1;
        let generation = gate.next_generation;
        let (outcome, _) = watch::channel(GateOutcome::Pending);
        info!(ns, range = %range, "critical section gate raised");
        gate.raised = Some(RaisedGate {
            range,
            generation,
            outcome,
        });
        Ok(generation)
    }

    /// Waits until every write admitted before the gate was raised has
    /// finished.
    pub async fn wait_drained(&self, ns: &str, deadline: Instant) -> Result<(), ShardError> {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let namespaces = self.namespaces.lock();
                let Some(gate) = namespaces.get(ns) else {
                    return Ok(());
                };
                let generation = gate
                    .raised
                    .as_ref()
                    .map(|g| g.generation)
                    .unwrap_or(gate.next_generation + 1);
                if gate.drained_before(generation) {
                    return Ok(());
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(ShardError::Timeout(format!(
                    "in-flight writes on '{ns}' did not drain"
                )));
            }
        }
    }

    /// Lowers the gate and wakes parked writes.
    pub fn release(&self, ns: &str, outcome: GateOutcome) -> bool {
        let raised = self
            .namespaces
            .lock()
            .get_mut(ns)
            .and_then(|gate| gate.raised.take());
        match raised {
            Some(gate) => {
                info!(ns, range = %gate.range, outcome = ?outcome, "critical section gate released");
                let _ = gate.outcome.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn raised_range(&self, ns: &str) -> Option<KeyRange> {
        self.namespaces
            .lock()
            .get(ns)
            .and_then(|g| g.raised.as_ref().map(|r| r.range.clone()))
    }

    pub fn inflight(&self, ns: &str) -> usize {
        self.namespaces
            .lock()
            .get(ns)
            .map(|g| g.inflight.values().sum())
            .unwrap_or(0)
    }
}
