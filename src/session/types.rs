use crate::oplog::{AssembledWrite, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Logical session id (`lsid`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type TxnNumber = i64;

/// Reply returned to the client for a write; stored verbatim for retries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteReply {
    pub n: u64,
    pub updated_existing: bool,
    /// findAndModify result document. Absent when nothing matched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upserted: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionWriteRecord {
    pub txn_number: TxnNumber,
    pub reply: WriteReply,
    /// Commit timestamp of the write.
    pub write_ts: Timestamp,
    /// Timestamp of the first oplog entry carrying the write.
    pub op_ts: Timestamp,
}

impl SessionWriteRecord {
    pub fn from_write(write: &AssembledWrite) -> Option<Self> {
        Some(Self {
            txn_number: write.entry.txn_number?,
            reply: write.entry.reply.clone()?,
            write_ts: write.entry.ts,
            op_ts: write.first_ts,
        })
    }
}
