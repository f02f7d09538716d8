use super::cursor::SessionCursorTable;
use super::phase::MigrationPhase;
use super::pump::{FetchControl, PumpProgress, PumpTarget, SessionPump, wait_caught_up};
use crate::catalog::{Catalog, ChunkVersion, MigrationRecord, ShardId};
use crate::cluster::Cluster;
use crate::config::ClusterConfig;
use crate::document::{KeyRange, KeyValue};
use crate::error::{ResourceType, ShardError};
use crate::oplog::Timestamp;
use crate::shard::{GateOutcome, Shard};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

/// A point where a running migration stops until released.
#[derive(Clone)]
pub struct PausePoint {
    reached: Arc<watch::Sender<bool>>,
    released: Arc<watch::Sender<bool>>,
}

impl Default for PausePoint {
    fn default() -> Self {
        Self::new()
    }
}

impl PausePoint {
    pub fn new() -> Self {
        Self {
            reached: Arc::new(watch::channel(false).0),
            released: Arc::new(watch::channel(false).0),
        }
    }

    pub async fn wait_reached(&self) {
        let _ = self.reached.subscribe().wait_for(|r| *r).await;
    }

    pub fn release(&self) {
        self.released.send_replace(true);
    }

    pub(crate) async fn pass(&self) {
        self.reached.send_replace(true);
        let _ = self.released.subscribe().wait_for(|r| *r).await;
    }
}

/// Test and flow-control hooks of one migration.
#[derive(Clone, Default)]
pub struct MigrationHooks {
    pub before_critical_section: Option<PausePoint>,
    pub session_fetch: Option<FetchControl>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MigrationStatus {
    pub ns: String,
    pub range: KeyRange,
    pub from: ShardId,
    pub to: ShardId,
    pub phase: MigrationPhase,
    pub pump: PumpProgress,
}

struct Control {
    phase: MigrationPhase,
    /// Set once commit has started flipping ownership in the catalog.
    flipping: bool,
}

/// Drives one chunk from its donor to a recipient.
pub struct MigrationCoordinator {
    ns: String,
    range: KeyRange,
    donor: Arc<Shard>,
    recipient: Arc<Shard>,
    catalog: Arc<Catalog>,
    config: ClusterConfig,
    control: Mutex<Control>,
    phase_tx: watch::Sender<MigrationPhase>,
    transfer_cursor: Mutex<Timestamp>,
    high_water: Mutex<Option<Timestamp>>,
    pump: tokio::sync::Mutex<Option<SessionPump>>,
    pump_progress: watch::Receiver<PumpProgress>,
}

impl MigrationCoordinator {
    /// Registers a migration of the chunk containing `find_key` to `to` and
    /// starts pumping session history to the recipient.
    pub fn start(
        cluster: &Cluster,
        ns: &str,
        find_key: &KeyValue,
        to: &str,
        hooks: &MigrationHooks,
    ) -> Result<Arc<Self>, ShardError> {
        let catalog = Arc::clone(cluster.catalog());
        let chunk = catalog.chunk_containing(ns, find_key)?;
        let invalid_shard = |id: &str| ShardError::NotFound {
            resource_type: ResourceType::Shard,
            resource_id: id.to_string(),
        };
        if !catalog.has_shard(to) {
            return Err(invalid_shard(to));
        }
        let recipient = cluster.shard(to).ok_or_else(|| invalid_shard(to))?;
        let donor = cluster
            .shard(&chunk.shard)
            .ok_or_else(|| invalid_shard(&chunk.shard))?;
        if chunk.shard == to {
            return Err(ShardError::Validation(format!(
                "chunk {} of '{ns}' is already on {to}",
                chunk.range
            )));
        }
        catalog.register_migration(MigrationRecord {
            ns: ns.to_string(),
            range: chunk.range.clone(),
            from: chunk.shard.clone(),
            to: to.to_string(),
            session_cursors: Default::default(),
        })?;

        let config = cluster.config().clone();
        let pump = SessionPump::spawn(
            PumpTarget {
                ns: ns.to_string(),
                range: chunk.range.clone(),
                donor: Arc::clone(&donor),
                recipient: Arc::clone(&recipient),
                catalog: Arc::clone(&catalog),
                batch_size: config.session_fetch_batch_size,
                idle: Duration::from_millis(config.session_pump_idle_ms),
            },
            hooks.session_fetch.clone().unwrap_or_default(),
            SessionCursorTable::new(),
        );
        let pump_progress = pump.subscribe();
        let coordinator = Arc::new(Self {
            ns: ns.to_string(),
            range: chunk.range.clone(),
            donor,
            recipient,
            catalog,
            config,
            control: Mutex::new(Control {
                phase: MigrationPhase::Cloning,
                flipping: false,
            }),
            phase_tx: watch::channel(MigrationPhase::Cloning).0,
            transfer_cursor: Mutex::new(Timestamp::ZERO),
            high_water: Mutex::new(None),
            pump: tokio::sync::Mutex::new(Some(pump)),
            pump_progress,
        });
        coordinator.watch_pump_failure();
        info!(
            ns,
            range = %coordinator.range,
            from = %coordinator.donor.id(),
            to,
            phase = %MigrationPhase::Cloning,
            "migration started"
        );
        Ok(coordinator)
    }

    pub fn phase(&self) -> MigrationPhase {
        self.control.lock().phase
    }

    pub fn range(&self) -> &KeyRange {
        &self.range
    }

    pub fn status(&self) -> MigrationStatus {
        MigrationStatus {
            ns: self.ns.clone(),
            range: self.range.clone(),
            from: self.donor.id().to_string(),
            to: self.recipient.id().to_string(),
            phase: self.phase(),
            pump: self.pump_progress.borrow().clone(),
        }
    }

    /// Copies the range snapshot to the recipient.
    pub async fn clone_range(&self) -> Result<usize, ShardError> {
        self.expect_phase(MigrationPhase::Cloning, MigrationPhase::CatchingUpOplog)?;
        let copied = self.copy_snapshot();
        let docs = self.or_abort(copied).await?;
        self.advance(MigrationPhase::CatchingUpOplog)?;
        Ok(docs)
    }

    fn copy_snapshot(&self) -> Result<usize, ShardError> {
        let snapshot = self.donor.clone_range(&self.ns, &self.range)?;
        let docs = self.recipient.receive_clone(&self.ns, &snapshot)?;
        *self.transfer_cursor.lock() = snapshot.ts;
        Ok(docs)
    }

    /// Ships transfer mods until a round finds nothing new, bounded by the
    /// configured number of rounds. Returns the rounds run.
    pub async fn catch_up(&self) -> Result<usize, ShardError> {
        self.expect_phase(MigrationPhase::CatchingUpOplog, MigrationPhase::CriticalSection)?;
        for round in 1..=self.config.catch_up_max_rounds {
            let shipped = self.transfer_round();
            if self.or_abort(shipped).await? == 0 {
                return Ok(round);
            }
        }
        Ok(self.config.catch_up_max_rounds)
    }

    fn transfer_round(&self) -> Result<usize, ShardError> {
        let after = *self.transfer_cursor.lock();
        let (mods, cursor) = self.donor.transfer_mods_since(&self.ns, &self.range, after)?;
        self.recipient.apply_transfer_mods(&self.ns, &self.range, &mods)?;
        *self.transfer_cursor.lock() = cursor;
        Ok(mods.len())
    }

    /// Blocks new writes to the range on the donor, waits for writes already
    /// admitted to reach the oplog, and ships the final transfer mods.
    /// Returns the value of the donor's critical section counter.
    pub async fn enter_critical_section(&self) -> Result<u64, ShardError> {
        self.expect_phase(MigrationPhase::CatchingUpOplog, MigrationPhase::CriticalSection)?;
        let gates = self.donor.gates();
        gates.raise(&self.ns, self.range.clone())?;
        if self.phase() != MigrationPhase::CatchingUpOplog {
            gates.release(&self.ns, GateOutcome::Aborted);
            return Err(self.aborted_error());
        }
        let deadline = Instant::now() + self.critical_section_timeout();
        let drained = gates.wait_drained(&self.ns, deadline).await;
        self.or_abort(drained).await?;
        let shipped = self.transfer_round();
        self.or_abort(shipped).await?;
        let high_water = self.donor.oplog().last_ts();
        *self.high_water.lock() = Some(high_water);
        let counter = self.donor.chunk_cache().bump_critical_section(&self.ns);
        self.advance(MigrationPhase::CriticalSection)?;
        info!(
            ns = %self.ns,
            range = %self.range,
            shard = %self.donor.id(),
            ts = %high_water,
            counter,
            phase = %MigrationPhase::CriticalSection,
            "entered critical section"
        );
        Ok(counter)
    }

    /// Waits for the recipient to hold all session history up to the
    /// critical section, then flips ownership. Returns the new chunk version.
    pub async fn commit(&self) -> Result<ChunkVersion, ShardError> {
        self.expect_phase(MigrationPhase::CriticalSection, MigrationPhase::Committed)?;
        let high_water = self.high_water.lock().unwrap_or(Timestamp::ZERO);
        let deadline = Instant::now() + self.critical_section_timeout();
        if let Err(reason) = wait_caught_up(self.pump_progress.clone(), high_water, deadline).await {
            self.abort(&reason).await?;
            return Err(ShardError::MigrationAborted { reason });
        }

        {
            let mut control = self.control.lock();
            if control.phase != MigrationPhase::CriticalSection {
                return Err(self.aborted_error());
            }
            control.flipping = true;
        }
        let flipped = self.catalog.commit_chunk_migration(
            &self.ns,
            &self.range,
            self.donor.id(),
            self.recipient.id(),
        );
        let version = match flipped {
            Ok(version) => version,
            Err(err) => {
                self.control.lock().flipping = false;
                self.abort(&format!("ownership flip failed: {err}")).await?;
                return Err(err);
            }
        };

        self.donor.refresh_metadata(&self.ns);
        self.recipient.refresh_metadata(&self.ns);
        {
            let mut control = self.control.lock();
            control.phase = MigrationPhase::Committed;
            control.flipping = false;
        }
        self.phase_tx.send_replace(MigrationPhase::Committed);
        self.donor.gates().release(&self.ns, GateOutcome::Committed);
        info!(
            ns = %self.ns,
            range = %self.range,
            from = %self.donor.id(),
            to = %self.recipient.id(),
            version = %version,
            phase = %MigrationPhase::Committed,
            "migration committed"
        );
        self.stop_pump().await;
        // Ownership has moved; cleanup failures no longer change the outcome.
        if let Err(err) = self.catalog.unregister_migration(&self.ns, &self.range) {
            warn!(ns = %self.ns, range = %self.range, error = %err, "committed migration left registered");
        }
        if let Err(err) = self.donor.delete_range_from_migrate(&self.ns, &self.range) {
            warn!(
                ns = %self.ns,
                range = %self.range,
                shard = %self.donor.id(),
                error = %err,
                "range deletion after commit failed"
            );
        }
        Ok(version)
    }

    /// Aborts unless the migration already ended. A commit that has started
    /// flipping ownership wins; the phase it resolved to is returned.
    pub async fn abort(&self, reason: &str) -> Result<MigrationPhase, ShardError> {
        loop {
            let mut terminal = {
                let mut control = self.control.lock();
                if control.phase.is_terminal() {
                    return Ok(control.phase);
                }
                if !control.flipping {
                    control.phase = control.phase.transition(MigrationPhase::Aborted)?;
                    break;
                }
                self.phase_tx.subscribe()
            };
            let _ = terminal.wait_for(|p| p.is_terminal()).await;
        }
        self.phase_tx.send_replace(MigrationPhase::Aborted);
        self.donor.gates().release(&self.ns, GateOutcome::Aborted);
        self.stop_pump().await;
        self.catalog.unregister_migration(&self.ns, &self.range)?;
        self.recipient.delete_range_from_migrate(&self.ns, &self.range)?;
        warn!(
            ns = %self.ns,
            range = %self.range,
            from = %self.donor.id(),
            to = %self.recipient.id(),
            reason,
            phase = %MigrationPhase::Aborted,
            "migration aborted"
        );
        Ok(MigrationPhase::Aborted)
    }

    fn critical_section_timeout(&self) -> Duration {
        Duration::from_millis(self.config.critical_section_timeout_ms)
    }

    fn aborted_error(&self) -> ShardError {
        ShardError::MigrationAborted {
            reason: format!("migration of {} on '{}' was aborted", self.range, self.ns),
        }
    }

    fn expect_phase(&self, expected: MigrationPhase, next: MigrationPhase) -> Result<(), ShardError> {
        match self.phase() {
            phase if phase == expected => Ok(()),
            MigrationPhase::Aborted => Err(self.aborted_error()),
            phase => Err(ShardError::IllegalTransition { from: phase, to: next }),
        }
    }

    fn advance(&self, next: MigrationPhase) -> Result<(), ShardError> {
        let phase = {
            let mut control = self.control.lock();
            if control.phase == MigrationPhase::Aborted {
                return Err(self.aborted_error());
            }
            control.phase = control.phase.transition(next)?;
            control.phase
        };
        self.phase_tx.send_replace(phase);
        info!(ns = %self.ns, range = %self.range, phase = %phase, "migration phase changed");
        Ok(())
    }

    /// Aborts the migration when `result` is an error.
    async fn or_abort<T>(&self, result: Result<T, ShardError>) -> Result<T, ShardError> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                self.abort(&err.to_string()).await?;
                Err(err)
            }
        }
    }

    async fn stop_pump(&self) {
        if let Some(mut pump) = self.pump.lock().await.take() {
            pump.stop().await;
        }
    }

    fn watch_pump_failure(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut progress = self.pump_progress.clone();
        tokio::spawn(async move {
            let failure = match progress.wait_for(|p| p.failure.is_some()).await {
                Ok(p) => p.failure.clone().unwrap_or_default(),
                Err(_) => return,
            };
            if let Some(coordinator) = weak.upgrade()
                && let Err(err) = coordinator
                    .abort(&format!("session history pump failed: {failure}"))
                    .await
            {
                warn!(ns = %coordinator.ns, error = %err, "abort after pump failure did not complete");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::{MigrationCoordinator, MigrationHooks};
    use crate::cluster::Cluster;
    use crate::config::ClusterConfig;
    use crate::document::{KeyValue, to_document};
    use crate::migration::pump::wait_caught_up;
    use crate::migration::{FetchControl, MigrationPhase};
    use crate::oplog::Timestamp;
    use crate::shard::{ShardWriteRequest, WriteOp};
    use serde_json::json;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::Instant;

    const NS: &str = "db.c";

    async fn cluster(dir: &Path, config: ClusterConfig) -> Cluster {
        let cluster = Cluster::open(dir, config, &["shard0", "shard1"]).expect("open");
        cluster.enable_sharding("db", Some("shard0")).expect("db");
        cluster.create_collection(NS).expect("create");
        cluster.shard_collection(NS, "x").expect("shard");
        let donor = cluster.shard("shard0").expect("shard0");
        for x in 1..=3 {
            donor
                .execute_write(ShardWriteRequest {
                    ns: NS.into(),
                    session: None,
                    op: WriteOp::Insert {
                        documents: vec![to_document(json!({"_id": x, "x": x})).expect("doc")],
                    },
                    version: None,
                })
                .await
                .expect("insert");
        }
        cluster
    }

    fn start(cluster: &Cluster, hooks: &MigrationHooks) -> Arc<MigrationCoordinator> {
        MigrationCoordinator::start(cluster, NS, &KeyValue::number(1.0), "shard1", hooks).expect("start")
    }

    async fn to_critical_section(migration: &MigrationCoordinator) {
        migration.clone_range().await.expect("clone");
        migration.catch_up().await.expect("catch up");
        migration.enter_critical_section().await.expect("critical section");
    }

    fn owner(cluster: &Cluster) -> String {
        cluster
            .catalog()
            .chunk_containing(NS, &KeyValue::number(1.0))
            .expect("chunk")
            .shard
    }

    #[tokio::test]
    async fn commit_aborts_when_session_history_never_catches_up() {
        let dir = tempdir().expect("tempdir");
        let config = ClusterConfig {
            critical_section_timeout_ms: 50,
            ..ClusterConfig::testing()
        };
        let cluster = cluster(dir.path(), config).await;
        let hooks = MigrationHooks {
            session_fetch: Some(FetchControl::paused()),
            ..MigrationHooks::default()
        };
        let migration = start(&cluster, &hooks);
        to_critical_section(&migration).await;

        let err = migration.commit().await.expect_err("pump is paused");
        assert_eq!(err.code_str(), "migration_aborted");
        assert!(err.to_string().contains("critical section timeout"));
        assert_eq!(migration.phase(), MigrationPhase::Aborted);
        assert_eq!(owner(&cluster), "shard0");
        assert!(cluster.catalog().active_migrations().is_empty());
        assert_eq!(cluster.shard("shard1").expect("shard1").count(NS), 0);
        assert!(cluster.shard("shard0").expect("shard0").gates().raised_range(NS).is_none());
    }

    #[tokio::test]
    async fn pump_failure_aborts_the_migration() {
        let dir = tempdir().expect("tempdir");
        let cluster = cluster(dir.path(), ClusterConfig::testing()).await;
        let control = FetchControl::new();
        control.fail_next_round();
        let hooks = MigrationHooks {
            session_fetch: Some(control),
            ..MigrationHooks::default()
        };
        let migration = start(&cluster, &hooks);

        let mut phases = migration.phase_tx.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            phases.wait_for(|p| *p == MigrationPhase::Aborted),
        )
        .await
        .expect("aborted in time")
        .expect("phase channel");
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cluster.catalog().active_migrations().is_empty() {
            assert!(Instant::now() < deadline, "migration still registered");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let err = migration.clone_range().await.expect_err("aborted");
        assert_eq!(err.code_str(), "migration_aborted");
        assert_eq!(owner(&cluster), "shard0");
    }

    #[tokio::test]
    async fn abort_after_ownership_flip_reports_committed() {
        let dir = tempdir().expect("tempdir");
        let cluster = cluster(dir.path(), ClusterConfig::testing()).await;
        let migration = start(&cluster, &MigrationHooks::default());
        to_critical_section(&migration).await;
        let high_water = migration.high_water.lock().unwrap_or(Timestamp::ZERO);
        wait_caught_up(
            migration.pump_progress.clone(),
            high_water,
            Instant::now() + Duration::from_secs(5),
        )
        .await
        .expect("caught up");

        let (committed, aborted) = tokio::join!(migration.commit(), migration.abort("operator request"));
        let version = committed.expect("commit wins");
        assert_eq!(aborted.expect("abort"), MigrationPhase::Committed);
        assert_eq!(migration.phase(), MigrationPhase::Committed);
        assert_eq!(owner(&cluster), "shard1");
        assert_eq!(cluster.catalog().routing_table(NS).expect("table").version, Some(version));
        assert_eq!(cluster.shard("shard1").expect("shard1").count(NS), 3);
    }

    #[tokio::test]
    async fn abort_waits_for_a_flip_in_progress() {
        let dir = tempdir().expect("tempdir");
        let cluster = cluster(dir.path(), ClusterConfig::testing()).await;
        let migration = start(&cluster, &MigrationHooks::default());
        to_critical_section(&migration).await;

        migration.control.lock().flipping = true;
        let resolve = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            {
                let mut control = migration.control.lock();
                control.phase = MigrationPhase::Committed;
                control.flipping = false;
            }
            migration.phase_tx.send_replace(MigrationPhase::Committed);
        };
        let (phase, ()) = tokio::join!(migration.abort("racing"), resolve);
        assert_eq!(phase.expect("abort"), MigrationPhase::Committed);
        assert!(cluster.shard("shard0").expect("shard0").gates().raised_range(NS).is_some());
        assert_eq!(cluster.catalog().active_migrations().len(), 1);
        migration.stop_pump().await;
    }

    #[tokio::test]
    async fn cleanup_failure_after_the_flip_still_returns_the_new_version() {
        let dir = tempdir().expect("tempdir");
        let cluster = cluster(dir.path(), ClusterConfig::testing()).await;
        let migration = start(&cluster, &MigrationHooks::default());
        to_critical_section(&migration).await;

        let catalog_file = dir.path().join("config.json");
        let mut phases = migration.phase_tx.subscribe();
        let break_catalog = async {
            let _ = phases.wait_for(|p| *p == MigrationPhase::Committed).await;
            std::fs::remove_file(&catalog_file).expect("remove catalog file");
            std::fs::create_dir(&catalog_file).expect("directory in its place");
            std::fs::write(catalog_file.join("blocker"), b"x").expect("blocker");
        };
        let (committed, ()) = tokio::join!(migration.commit(), break_catalog);
        let version = committed.expect("ownership moved");
        assert_eq!(migration.phase(), MigrationPhase::Committed);
        assert_eq!(owner(&cluster), "shard1");
        assert_eq!(cluster.catalog().routing_table(NS).expect("table").version, Some(version));
        assert_eq!(cluster.catalog().active_migrations().len(), 1);
        assert_eq!(cluster.shard("shard0").expect("shard0").count(NS), 0);
    }
}
