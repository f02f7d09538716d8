use super::types::{SessionId, SessionWriteRecord, TxnNumber, WriteReply};
use crate::error::ShardError;
use crate::oplog::Oplog;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

type RecordTable = Arc<Mutex<HashMap<SessionId, SessionWriteRecord>>>;
type WriterTable = Arc<Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>>;

/// Last executed write per session.
///
/// Writers on one session are serialized through [`SessionStore::checkout`];
/// the table itself is only changed through [`SessionStore::record_if_absent`]
/// and the import paths, and only ever to a higher txn number.
#[derive(Default)]
pub struct SessionStore {
    records: RecordTable,
    /// Writer locks of sessions that are checked out or waited on.
    writers: WriterTable,
    #[cfg(test)]
    fail_next_record: AtomicBool,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the table from records recovered out of the oplog.
    pub fn from_records(records: impl IntoIterator<Item = (SessionId, SessionWriteRecord)>) -> Self {
        let store = Self::new();
        for (session, record) in records {
            store.install_if_newer(session, record);
        }
        store
    }

    /// Waits until no other writer holds `session`.
    pub async fn checkout(&self, session: SessionId) -> SessionCheckout {
        let lock = Arc::clone(self.writers.lock().entry(session).or_default());
        let guard = lock.lock_owned().await;
        SessionCheckout {
            session,
            records: Arc::clone(&self.records),
            writers: Arc::clone(&self.writers),
            guard: Some(guard),
        }
    }

    /// Sessions with a live writer lock.
    pub fn writer_count(&self) -> usize {
        self.writers.lock().len()
    }

    /// Stores `record` unless a record for the same txn exists, in which case
    /// the stored one is returned unchanged. Returns `(is_new, stored)`.
    pub fn record_if_absent(
        &self,
        session: SessionId,
        record: SessionWriteRecord,
    ) -> Result<(bool, SessionWriteRecord), ShardError> {
        #[cfg(test)]
        {
            if self.fail_next_record.swap(false, Ordering::SeqCst) {
                return Err(ShardError::Io(std::io::Error::other(
                    "injected session record failure",
                )));
            }
        }
        record_if_absent(&self.records, session, record)
    }

    pub fn get(&self, session: SessionId) -> Option<SessionWriteRecord> {
        self.records.lock().get(&session).cloned()
    }

    /// Installs history migrated from a donor when it is newer than what this
    /// shard holds. Returns whether the record was installed.
    pub fn import_migrated(&self, session: SessionId, record: SessionWriteRecord) -> bool {
        let installed = self.install_if_newer(session, record);
        if installed {
            debug!(session = %session, "imported migrated session write");
        }
        installed
    }

    pub fn sessions(&self) -> Vec<(SessionId, SessionWriteRecord)> {
        let mut out: Vec<_> = self
            .records
            .lock()
            .iter()
            .map(|(s, r)| (*s, r.clone()))
            .collect();
        out.sort_by_key(|(s, _)| *s);
        out
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn fail_next_record(&self) {
        self.fail_next_record.store(true, Ordering::SeqCst);
    }

    fn install_if_newer(&self, session: SessionId, record: SessionWriteRecord) -> bool {
        let mut records = self.records.lock();
        match records.get(&session) {
            Some(existing) if existing.txn_number >= record.txn_number => false,
            _ => {
                records.insert(session, record);
                true
            }
        }
    }
}

fn record_if_absent(
    records: &RecordTable,
    session: SessionId,
    record: SessionWriteRecord,
) -> Result<(bool, SessionWriteRecord), ShardError> {
    let mut records = records.lock();
    match records.get(&session) {
        Some(existing) if existing.txn_number == record.txn_number => Ok((false, existing.clone())),
        Some(existing) if existing.txn_number > record.txn_number => {
            Err(ShardError::TransactionTooOld {
                session: session.to_string(),
                txn_number: record.txn_number,
                active: existing.txn_number,
            })
        }
        _ => {
            records.insert(session, record.clone());
            Ok((true, record))
        }
    }
}

/// Exclusive right to execute a write on one session.
pub struct SessionCheckout {
    session: SessionId,
    records: RecordTable,
    writers: WriterTable,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for SessionCheckout {
    fn drop(&mut self) {
        // Clones of a writer lock are only taken under the table lock, so a
        // count of one means nobody else holds or waits for it.
        let mut writers = self.writers.lock();
        drop(self.guard.take());
        if writers
            .get(&self.session)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            writers.remove(&self.session);
        }
    }
}

impl SessionCheckout {
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// The reply to hand back if `txn` already executed, an error if `txn` is
    /// older than the session's active txn, `None` if it must execute.
    pub fn stored_reply(&self, txn: TxnNumber) -> Result<Option<WriteReply>, ShardError> {
        match self.records.lock().get(&self.session) {
            Some(record) if record.txn_number == txn => Ok(Some(record.reply.clone())),
            Some(record) if record.txn_number > txn => Err(ShardError::TransactionTooOld {
                session: self.session.to_string(),
                txn_number: txn,
                active: record.txn_number,
            }),
            _ => Ok(None),
        }
    }

    /// Looks for `txn` in the oplog when the table has no record of it, which
    /// happens when recording failed after the write became durable. A hit is
    /// written back to the table.
    pub fn resolve_from_oplog(
        &self,
        oplog: &Oplog,
        txn: TxnNumber,
    ) -> Result<Option<WriteReply>, ShardError> {
        let Some(record) = oplog.find_session_write(self.session, txn)? else {
            return Ok(None);
        };
        warn!(
            session = %self.session,
            txn_number = txn,
            ts = %record.write_ts,
            "answering retry from oplog; session table was missing the record"
        );
        let (_, stored) = record_if_absent(&self.records, self.session, record)?;
        Ok(Some(stored.reply))
    }
}
