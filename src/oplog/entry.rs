use crate::error::ShardError;
use crate::session::{SessionId, TxnNumber, WriteReply};
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use serde_json::Value;
use std::collections::BTreeSet;

/// Logical oplog timestamp. Totally ordered by `(secs, inc)`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub secs: u32,
    pub inc: u32,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { secs: 0, inc: 0 };

    pub fn new(secs: u32, inc: u32) -> Self {
        Self { secs, inc }
    }

    /// Smallest timestamp strictly greater than `self` whose seconds are at
    /// least `now_secs`.
    pub fn successor(self, now_secs: u32) -> Self {
        if now_secs > self.secs {
            return Self::new(now_secs, 1);
        }
        match self.inc.checked_add(1) {
            Some(inc) => Self::new(self.secs, inc),
            None => Self::new(self.secs.saturating_add(1), 1),
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Timestamp({}, {})", self.secs, self.inc)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    #[serde(rename = "i")]
    Insert,
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "d")]
    Delete,
    #[serde(rename = "c")]
    Command,
    #[serde(rename = "n")]
    Noop,
}

/// Position of one entry inside a chained write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainLink {
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_ts: Option<Timestamp>,
    /// `true` on fragment links, `false` on the terminal commit link.
    #[serde(rename = "partialChain")]
    pub partial: bool,
    /// Number of fragments, only on the terminal link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OplogEntry {
    pub op: OpKind,
    pub ns: String,
    pub o: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub o2: Option<Value>,
    #[serde(default)]
    pub ts: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lsid: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txn_number: Option<TxnNumber>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<i64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub from_migrate: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<WriteReply>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<ChainLink>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment: Option<ByteBuf>,
}

impl OplogEntry {
    pub fn new(op: OpKind, ns: impl Into<String>, o: Value) -> Self {
        Self {
            op,
            ns: ns.into(),
            o,
            o2: None,
            ts: Timestamp::ZERO,
            lsid: None,
            txn_number: None,
            rid: None,
            from_migrate: false,
            reply: None,
            chain: None,
            fragment: None,
        }
    }

    pub fn insert(ns: impl Into<String>, doc: Value) -> Self {
        Self::new(OpKind::Insert, ns, doc)
    }

    pub fn update(ns: impl Into<String>, diff: Value, document_key: Value) -> Self {
        Self {
            o2: Some(document_key),
            ..Self::new(OpKind::Update, ns, diff)
        }
    }

    pub fn delete(ns: impl Into<String>, document_key: Value) -> Self {
        Self::new(OpKind::Delete, ns, document_key)
    }

    pub fn command(ns: impl Into<String>, cmd: Value) -> Self {
        Self::new(OpKind::Command, ns, cmd)
    }

    pub fn noop(ns: impl Into<String>, msg: Value) -> Self {
        Self::new(OpKind::Noop, ns, msg)
    }

    pub fn with_session(mut self, session: SessionId, txn: TxnNumber) -> Self {
        self.lsid = Some(session);
        self.txn_number = Some(txn);
        self
    }

    pub fn with_reply(mut self, reply: WriteReply) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn from_migrate(mut self) -> Self {
        self.from_migrate = true;
        self
    }

    /// Collection the entry writes to. Chain links and `applyOps` commands
    /// are logged against `admin.$cmd` and name their target inside `o`.
    /// For batches spanning several collections this is the first one.
    pub fn target_ns(&self) -> &str {
        let inner = match self.o.get("applyOps") {
            Some(Value::Array(ops)) => ops.first().and_then(|op| op.get("ns")),
            Some(link) => link.get("ns"),
            None => None,
        };
        inner.and_then(Value::as_str).unwrap_or(&self.ns)
    }

    /// Every collection the entry writes to. `applyOps` batches contribute
    /// the namespace of each nested operation; chain links carry the list
    /// of the write they belong to.
    pub fn target_namespaces(&self) -> BTreeSet<String> {
        let mut targets = BTreeSet::new();
        match self.o.get("applyOps") {
            Some(Value::Array(_)) => {
                targets.extend(self.data_ops().into_iter().map(|op| op.ns));
            }
            Some(link) => {
                if let Some(list) = link.get("namespaces").and_then(Value::as_array) {
                    targets.extend(list.iter().filter_map(Value::as_str).map(str::to_string));
                }
            }
            None => {}
        }
        if targets.is_empty() {
            targets.insert(self.target_ns().to_string());
        }
        targets
    }

    /// The entry itself, or the operations of an `applyOps` batch with
    /// nested batches flattened. Operations that do not decode are skipped.
    pub fn data_ops(&self) -> Vec<OplogEntry> {
        let Some(Value::Array(ops)) = self.o.get("applyOps") else {
            return vec![self.clone()];
        };
        ops.iter()
            .filter_map(|op| serde_json::from_value::<OplogEntry>(op.clone()).ok())
            .flat_map(|op| op.data_ops())
            .collect()
    }

    pub fn is_chain_fragment(&self) -> bool {
        self.chain.as_ref().is_some_and(|c| c.partial)
    }

    pub fn is_chain_terminal(&self) -> bool {
        self.chain.as_ref().is_some_and(|c| !c.partial)
    }

    pub fn session_key(&self) -> Option<(SessionId, TxnNumber)> {
        Some((self.lsid?, self.txn_number?))
    }

    pub fn encode(&self) -> Result<Vec<u8>, ShardError> {
        rmp_serde::to_vec_named(self).map_err(ShardError::encode)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ShardError> {
        rmp_serde::from_slice(bytes).map_err(ShardError::decode)
    }
}
