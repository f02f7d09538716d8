use super::cursor::SessionCursorTable;
use crate::catalog::Catalog;
use crate::document::KeyRange;
use crate::error::ShardError;
use crate::oplog::Timestamp;
use crate::shard::Shard;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error};

/// Flow control of a session-history pump. While paused the pump simply
/// stops asking the donor for history; its cursors stay where they are.
#[derive(Clone)]
pub struct FetchControl {
    paused: Arc<watch::Sender<bool>>,
    fail_next_round: Arc<AtomicBool>,
}

impl Default for FetchControl {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchControl {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            paused: Arc::new(paused),
            fail_next_round: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn paused() -> Self {
        let control = Self::new();
        control.pause();
        control
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    async fn wait_resumed(&self) {
        let mut rx = self.paused.subscribe();
        let _ = rx.wait_for(|paused| !*paused).await;
    }

    /// Makes the next fetch round fail as if the donor had errored.
    pub fn fail_next_round(&self) {
        self.fail_next_round.store(true, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> Option<ShardError> {
        self.fail_next_round
            .swap(false, Ordering::SeqCst)
            .then(|| ShardError::Io(std::io::Error::other("injected pump failure")))
    }
}

/// What the pump has achieved so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PumpProgress {
    /// Every in-range session write at or below this donor timestamp has
    /// been imported by the recipient.
    pub caught_up_to: Timestamp,
    pub rounds: u64,
    pub imported: usize,
    pub failure: Option<String>,
}

pub(crate) struct PumpTarget {
    pub ns: String,
    pub range: KeyRange,
    pub donor: Arc<Shard>,
    pub recipient: Arc<Shard>,
    pub catalog: Arc<Catalog>,
    pub batch_size: usize,
    pub idle: Duration,
}

/// Background task copying retryable-write history of the migrating range
/// from donor to recipient.
pub struct SessionPump {
    progress: watch::Receiver<PumpProgress>,
    stop: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl SessionPump {
    pub(crate) fn spawn(target: PumpTarget, control: FetchControl, cursors: SessionCursorTable) -> Self {
        let (progress_tx, progress) = watch::channel(PumpProgress::default());
        let (stop, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run(target, control, cursors, progress_tx, stop_rx));
        Self {
            progress,
            stop,
            handle: Some(handle),
        }
    }

    pub fn progress(&self) -> PumpProgress {
        self.progress.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PumpProgress> {
        self.progress.clone()
    }

    /// Stops the pump after its current round.
    pub async fn stop(&mut self) {
        self.stop.send_replace(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

/// Waits until `progress` covers `high_water`, the pump fails, or
/// `deadline` passes.
pub(crate) async fn wait_caught_up(
    mut progress: watch::Receiver<PumpProgress>,
    high_water: Timestamp,
    deadline: Instant,
) -> Result<(), String> {
    let waited = tokio::time::timeout_at(
        deadline,
        progress.wait_for(|p| p.caught_up_to >= high_water || p.failure.is_some()),
    )
    .await;
    match waited {
        Err(_) => Err(format!(
            "session history did not reach {high_water} within the critical section timeout"
        )),
        Ok(Err(_)) => Err("session history pump stopped".into()),
        Ok(Ok(p)) => match &p.failure {
            Some(failure) => Err(failure.clone()),
            None => Ok(()),
        },
    }
}

async fn run(
    target: PumpTarget,
    control: FetchControl,
    mut cursors: SessionCursorTable,
    progress: watch::Sender<PumpProgress>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            return;
        }
        if control.is_paused() {
            debug!(ns = %target.ns, "session history fetch paused");
            tokio::select! {
                _ = control.wait_resumed() => {}
                changed = stop.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            continue;
        }
        match round(&target, &control, &mut cursors).await {
            Ok((high_water, imported)) => {
                progress.send_modify(|p| {
                    p.caught_up_to = p.caught_up_to.max(high_water);
                    p.rounds += 1;
                    p.imported += imported;
                });
            }
            Err(err) => {
                error!(ns = %target.ns, range = %target.range, error = %err, "session history pump failed");
                progress.send_modify(|p| p.failure = Some(err.to_string()));
                return;
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(target.idle) => {}
            changed = stop.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

async fn round(
    target: &PumpTarget,
    control: &FetchControl,
    cursors: &mut SessionCursorTable,
) -> Result<(Timestamp, usize), ShardError> {
    if let Some(err) = control.take_injected_failure() {
        return Err(err);
    }

    let PumpTarget {
        ns,
        range,
        donor,
        recipient,
        ..
    } = target;
    let (found, high_water) = donor.sessions_touching(ns, range, cursors.scanned())?;
    for session in found {
        cursors.track(session);
    }
    let before = cursors.snapshot();
    let mut imported = 0;
    let tracked: Vec<_> = cursors.sessions().collect();
    for (session, mut cursor) in tracked {
        loop {
            let (writes, next) =
                donor.session_writes_since(ns, range, session, cursor, target.batch_size)?;
            imported += recipient.import_session_history(ns, &writes).await?;
            cursors.advance(session, next);
            if writes.len() < target.batch_size || next == cursor {
                break;
            }
            cursor = next;
        }
    }
    cursors.advance_scan(high_water);
    if cursors.snapshot() != before {
        target
            .catalog
            .update_migration_cursors(ns, range, &cursors.snapshot())?;
    }
    Ok((high_water, imported))
}
