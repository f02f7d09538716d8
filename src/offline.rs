use crate::error::ShardError;
use crate::oplog::{ChainAssembler, OPLOG_FILE_NAME, OplogEntry, Timestamp};
use crate::session::{SessionId, SessionStore, SessionWriteRecord};
use crate::wal::scan_frames;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OplogReport {
    pub ok: bool,
    pub entries: u64,
    /// Logical writes after chain reassembly.
    pub writes: u64,
    /// Writes that spanned more than one entry.
    pub chained_writes: u64,
    pub last_ts: Timestamp,
    pub violations: Vec<String>,
}

/// Decodes every intact entry of the oplog under `shard_dir`. A torn tail is
/// skipped; a corrupt frame or undecodable entry is an error.
pub fn dump_oplog(shard_dir: &Path) -> Result<Vec<OplogEntry>, ShardError> {
    let path = shard_dir.join(OPLOG_FILE_NAME);
    let scan = scan_frames(&path)?;
    if let Some(offset) = scan.corrupt_at {
        return Err(ShardError::IntegrityError {
            message: format!("{} has a corrupt frame at offset {offset}", path.display()),
        });
    }
    scan.frames
        .iter()
        .map(|frame| OplogEntry::decode(&frame.payload))
        .collect()
}

/// Checks the oplog under `shard_dir` without modifying it.
pub fn verify_oplog(shard_dir: &Path) -> Result<OplogReport, ShardError> {
    let scan = scan_frames(&shard_dir.join(OPLOG_FILE_NAME))?;
    let mut violations = Vec::new();
    if let Some(offset) = scan.corrupt_at {
        violations.push(format!("frame checksum mismatch at offset {offset}"));
    }
    if let Some(offset) = scan.truncated_at {
        violations.push(format!("torn final frame at offset {offset}"));
    }

    let mut last_ts = Timestamp::ZERO;
    let mut assembler = ChainAssembler::new();
    let (mut writes, mut chained_writes) = (0, 0);
    for (i, frame) in scan.frames.iter().enumerate() {
        let entry = match OplogEntry::decode(&frame.payload) {
            Ok(entry) => entry,
            Err(err) => {
                violations.push(format!("entry {i} does not decode: {err}"));
                continue;
            }
        };
        if entry.ts <= last_ts {
            violations.push(format!("entry {i} timestamp {} does not follow {last_ts}", entry.ts));
        }
        last_ts = last_ts.max(entry.ts);
        if let Some(write) = assembler.feed(&entry)? {
            writes += 1;
            if write.links > 1 {
                chained_writes += 1;
            }
        }
    }
    assembler.finish();
    if assembler.discarded() > 0 {
        violations.push(format!("{} incomplete chained writes", assembler.discarded()));
    }

    Ok(OplogReport {
        ok: violations.is_empty(),
        entries: scan.frames.len() as u64,
        writes,
        chained_writes,
        last_ts,
        violations,
    })
}

/// Session table as it would be rebuilt when the shard next opens.
pub fn list_sessions(shard_dir: &Path) -> Result<Vec<(SessionId, SessionWriteRecord)>, ShardError> {
    let entries = dump_oplog(shard_dir)?;
    let mut assembler = ChainAssembler::new();
    let mut records = Vec::new();
    for entry in &entries {
        if let Some(write) = assembler.feed(entry)?
            && let (Some(session), Some(record)) = (write.entry.lsid, SessionWriteRecord::from_write(&write))
        {
            records.push((session, record));
        }
    }
    Ok(SessionStore::from_records(records).sessions())
}
