pub mod chain;
pub mod entry;

pub use chain::{AssembledWrite, ChainAssembler, assemble_all, split_into_chain};
pub use entry::{ChainLink, OpKind, OplogEntry, Timestamp};

use crate::config::ClusterConfig;
use crate::error::ShardError;
use crate::session::{SessionId, SessionWriteRecord, TxnNumber};
use crate::wal::LogFile;
use crate::wal::frame::FRAME_KIND_OPLOG_ENTRY;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub const OPLOG_FILE_NAME: &str = "oplog.log";

#[derive(Default)]
struct OplogIndex {
    entries: Vec<Arc<OplogEntry>>,
    by_session: HashMap<SessionId, Vec<usize>>,
    by_ns: HashMap<String, Vec<usize>>,
}

impl OplogIndex {
    fn push(&mut self, entry: Arc<OplogEntry>) {
        let pos = self.entries.len();
        if let Some(session) = entry.lsid {
            self.by_session.entry(session).or_default().push(pos);
        }
        for ns in entry.target_namespaces() {
            self.by_ns.entry(ns).or_default().push(pos);
        }
        self.entries.push(entry);
    }

    /// Positions from `list` whose entries are strictly after `after`.
    fn tail<'a>(&self, list: &'a [usize], after: Timestamp) -> &'a [usize] {
        let start = list.partition_point(|&pos| self.entries[pos].ts <= after);
        &list[start..]
    }
}

struct OplogWriter {
    log: LogFile,
    last_ts: Timestamp,
}

/// Result of appending one logical write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendedWrite {
    /// Timestamp of the first entry written for the write.
    pub first_ts: Timestamp,
    /// Timestamp at which the write commits (terminal link for chains).
    pub ts: Timestamp,
    pub links: usize,
}

/// Durable, totally ordered operation log of one shard.
pub struct Oplog {
    writer: Mutex<OplogWriter>,
    index: Arc<RwLock<OplogIndex>>,
    max_entry_bytes: usize,
    fragment_bytes: usize,
}

impl Oplog {
    pub fn open(dir: &Path, config: &ClusterConfig) -> Result<Self, ShardError> {
        let (log, frames) = LogFile::open(dir.join(OPLOG_FILE_NAME), config.sync_on_append())?;
        let mut index = OplogIndex::default();
        let mut last_ts = Timestamp::ZERO;
        for frame in frames {
            let entry = OplogEntry::decode(&frame.payload)?;
            if entry.ts <= last_ts {
                return Err(ShardError::IntegrityError {
                    message: format!("oplog timestamp {} does not follow {last_ts}", entry.ts),
                });
            }
            last_ts = entry.ts;
            index.push(Arc::new(entry));
        }
        if !index.entries.is_empty() {
            info!(
                path = %log.path().display(),
                entries = index.entries.len(),
                last_ts = %last_ts,
                "oplog recovered"
            );
        }
        Ok(Self {
            writer: Mutex::new(OplogWriter { log, last_ts }),
            index: Arc::new(RwLock::new(index)),
            max_entry_bytes: config.max_oplog_entry_bytes,
            fragment_bytes: config.chain_fragment_bytes(),
        })
    }

    /// Appends one entry and returns its timestamp. The entry is durable and
    /// visible to fetchers once this returns.
    pub fn append(&self, entry: OplogEntry) -> Result<Timestamp, ShardError> {
        let mut writer = self.writer.lock();
        let ts = self.write_locked(&mut writer, vec![entry])?;
        Ok(ts.ts)
    }

    /// Appends a logical write, chaining it across several entries when its
    /// encoded form exceeds the entry size limit.
    pub fn append_write(&self, entry: OplogEntry) -> Result<AppendedWrite, ShardError> {
        let encoded_len = entry.encode()?.len();
        let links = if encoded_len > self.max_entry_bytes {
            let links = split_into_chain(&entry, self.fragment_bytes)?;
            info!(
                ns = %entry.target_ns(),
                bytes = encoded_len,
                links = links.len(),
                "splitting oversized write into oplog chain"
            );
            links
        } else {
            vec![entry]
        };
        let mut writer = self.writer.lock();
        self.write_locked(&mut writer, links)
    }

    fn write_locked(
        &self,
        writer: &mut OplogWriter,
        mut entries: Vec<OplogEntry>,
    ) -> Result<AppendedWrite, ShardError> {
        let now_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;
        let mut ts = writer.last_ts;
        let mut prev = None;
        let mut first_ts = None;
        let mut payloads = Vec::with_capacity(entries.len());
        for entry in &mut entries {
            ts = ts.successor(now_secs);
            entry.ts = ts;
            if let Some(link) = entry.chain.as_mut() {
                link.prev_ts = if link.index == 0 { None } else { prev };
            }
            prev = Some(ts);
            first_ts.get_or_insert(ts);
            let payload = entry.encode()?;
            if payload.len() > self.max_entry_bytes {
                return Err(ShardError::Validation(format!(
                    "oplog entry of {} bytes exceeds the {} byte limit",
                    payload.len(),
                    self.max_entry_bytes
                )));
            }
            payloads.push(payload);
        }
        writer.log.append_all(
            entries
                .iter()
                .zip(&payloads)
                .map(|(entry, payload)| (entry.ts.secs, entry.ts.inc, FRAME_KIND_OPLOG_ENTRY, payload.as_slice())),
        )?;
        writer.last_ts = ts;
        let links = entries.len();
        let mut index = self.index.write();
        for entry in entries {
            debug!(ts = %entry.ts, ns = %entry.target_ns(), op = ?entry.op, "oplog append");
            index.push(Arc::new(entry));
        }
        Ok(AppendedWrite {
            first_ts: first_ts.unwrap_or(ts),
            ts,
            links,
        })
    }

    pub fn last_ts(&self) -> Timestamp {
        self.index
            .read()
            .entries
            .last()
            .map(|e| e.ts)
            .unwrap_or(Timestamp::ZERO)
    }

    pub fn len(&self) -> usize {
        self.index.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lazy history of `session` after `after`, bounded by the entries that
    /// exist now. Restart by calling again with the last observed timestamp.
    pub fn fetch_since(&self, session: SessionId, after: Timestamp) -> SessionHistory {
        let index = self.index.read();
        let positions = index
            .by_session
            .get(&session)
            .map(|list| index.tail(list, after).to_vec())
            .unwrap_or_default();
        SessionHistory {
            index: Arc::clone(&self.index),
            positions,
            next: 0,
            cursor: after,
        }
    }

    /// Entries writing to `ns` strictly after `after`, in order. A batch
    /// touching several collections is returned for each of them.
    pub fn fetch_namespace_since(&self, ns: &str, after: Timestamp) -> Vec<Arc<OplogEntry>> {
        let index = self.index.read();
        index
            .by_ns
            .get(ns)
            .map(|list| {
                index
                    .tail(list, after)
                    .iter()
                    .map(|&pos| Arc::clone(&index.entries[pos]))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn entries_since(&self, after: Timestamp) -> Vec<Arc<OplogEntry>> {
        let index = self.index.read();
        let start = index.entries.partition_point(|e| e.ts <= after);
        index.entries[start..].to_vec()
    }

    /// Sessions that logged at least one entry against `ns` after `after`.
    pub fn sessions_for_namespace(&self, ns: &str, after: Timestamp) -> BTreeSet<SessionId> {
        self.fetch_namespace_since(ns, after)
            .iter()
            .filter_map(|e| e.lsid)
            .collect()
    }

    /// Rebuilds the stored outcome of `(session, txn)` from the log.
    pub fn find_session_write(
        &self,
        session: SessionId,
        txn: TxnNumber,
    ) -> Result<Option<SessionWriteRecord>, ShardError> {
        let history: Vec<Arc<OplogEntry>> = self
            .fetch_since(session, Timestamp::ZERO)
            .filter(|e| e.txn_number == Some(txn))
            .collect();
        let writes = assemble_all(history.iter().map(|e| e.as_ref()))?;
        Ok(writes
            .into_iter()
            .rev()
            .find(|w| w.entry.reply.is_some())
            .and_then(|w| SessionWriteRecord::from_write(&w)))
    }

    /// Every logical write in the log, with chains reassembled.
    pub fn assembled_writes(&self) -> Result<Vec<AssembledWrite>, ShardError> {
        let entries = self.entries_since(Timestamp::ZERO);
        let mut assembler = ChainAssembler::new();
        let mut out = Vec::new();
        for entry in &entries {
            if let Some(write) = assembler.feed(entry)? {
                out.push(write);
            }
        }
        if assembler.finish() {
            warn!("dropping incomplete oplog chain at end of log");
        }
        Ok(out)
    }
}

/// Cursor-driven iterator over one session's oplog entries.
pub struct SessionHistory {
    index: Arc<RwLock<OplogIndex>>,
    positions: Vec<usize>,
    next: usize,
    cursor: Timestamp,
}

impl SessionHistory {
    /// Timestamp of the last entry yielded, or the starting point.
    pub fn cursor(&self) -> Timestamp {
        self.cursor
    }

    pub fn remaining(&self) -> usize {
        self.positions.len() - self.next
    }
}

impl Iterator for SessionHistory {
    type Item = Arc<OplogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let pos = *self.positions.get(self.next)?;
        self.next += 1;
        let entry = Arc::clone(self.index.read().entries.get(pos)?);
        self.cursor = entry.ts;
        Some(entry)
    }
}
