use super::entry::{ChainLink, OpKind, OplogEntry, Timestamp};
use crate::error::ShardError;
use serde_bytes::ByteBuf;
use serde_json::json;
use tracing::warn;

pub const CHAIN_NS: &str = "admin.$cmd";

/// Splits an oversized write into `k` fragment links plus one terminal link.
///
/// Fragments carry consecutive slices of the encoded entry; the terminal link
/// carries the reply and commits the chain. `prev_ts` is filled in at append
/// time once timestamps are assigned.
pub fn split_into_chain(entry: &OplogEntry, fragment_bytes: usize) -> Result<Vec<OplogEntry>, ShardError> {
    if fragment_bytes == 0 {
        return Err(ShardError::InvalidConfig {
            message: "chain fragment size must be > 0".into(),
        });
    }
    let mut inner = entry.clone();
    inner.ts = Timestamp::ZERO;
    let reply = inner.reply.take();
    let bytes = inner.encode()?;
    let target = entry.target_ns().to_string();
    let targets = entry.target_namespaces();
    let body = |key: &str, value: u32| {
        let mut body = json!({"ns": target, key: value});
        if targets.len() > 1 {
            body["namespaces"] = json!(targets);
        }
        json!({"applyOps": body})
    };

    let fragments: Vec<&[u8]> = bytes.chunks(fragment_bytes).collect();
    let count = u32::try_from(fragments.len())
        .map_err(|_| ShardError::Validation("write too large to chain".into()))?;
    let mut links = Vec::with_capacity(fragments.len() + 1);
    for (index, fragment) in fragments.into_iter().enumerate() {
        let index = index as u32;
        links.push(OplogEntry {
            lsid: entry.lsid,
            txn_number: entry.txn_number,
            from_migrate: entry.from_migrate,
            chain: Some(ChainLink {
                index,
                prev_ts: None,
                partial: true,
                count: None,
            }),
            fragment: Some(ByteBuf::from(fragment.to_vec())),
            ..OplogEntry::new(OpKind::Command, CHAIN_NS, body("fragment", index))
        });
    }
    links.push(OplogEntry {
        lsid: entry.lsid,
        txn_number: entry.txn_number,
        from_migrate: entry.from_migrate,
        reply,
        chain: Some(ChainLink {
            index: count,
            prev_ts: None,
            partial: false,
            count: Some(count),
        }),
        ..OplogEntry::new(OpKind::Command, CHAIN_NS, body("commitChain", count))
    });
    Ok(links)
}

struct PendingChain {
    bytes: Vec<u8>,
    next_index: u32,
    last_ts: Timestamp,
    first_ts: Timestamp,
}

/// Reassembles chained writes from an ordered entry stream.
///
/// Plain entries pass straight through. A chain that is interrupted by an
/// unrelated entry, or left open when the stream ends, is dropped whole.
#[derive(Default)]
pub struct ChainAssembler {
    pending: Option<PendingChain>,
    discarded: usize,
}

/// One logical write produced by the assembler.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledWrite {
    pub entry: OplogEntry,
    /// Timestamp of the first entry that carried the write.
    pub first_ts: Timestamp,
    /// Number of oplog entries the write occupied.
    pub links: usize,
}

impl ChainAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, entry: &OplogEntry) -> Result<Option<AssembledWrite>, ShardError> {
        let Some(link) = entry.chain.as_ref() else {
            self.drop_pending(entry.ts);
            return Ok(Some(AssembledWrite {
                entry: entry.clone(),
                first_ts: entry.ts,
                links: 1,
            }));
        };

        if link.partial {
            if link.index == 0 {
                self.drop_pending(entry.ts);
                let fragment = entry.fragment.as_ref().map(|b| b.to_vec()).unwrap_or_default();
                self.pending = Some(PendingChain {
                    bytes: fragment,
                    next_index: 1,
                    last_ts: entry.ts,
                    first_ts: entry.ts,
                });
                return Ok(None);
            }
            let continues = self
                .pending
                .as_ref()
                .is_some_and(|p| p.next_index == link.index && link.prev_ts == Some(p.last_ts));
            if !continues {
                self.drop_pending(entry.ts);
                return Ok(None);
            }
            if let Some(pending) = self.pending.as_mut() {
                if let Some(fragment) = entry.fragment.as_ref() {
                    pending.bytes.extend_from_slice(fragment);
                }
                pending.next_index += 1;
                pending.last_ts = entry.ts;
            }
            return Ok(None);
        }

        let Some(pending) = self.pending.take() else {
            warn!(ts = %entry.ts, "chain commit without fragments");
            self.discarded += 1;
            return Ok(None);
        };
        if Some(pending.next_index) != link.count || link.prev_ts != Some(pending.last_ts) {
            warn!(ts = %entry.ts, "chain commit does not match its fragments");
            self.discarded += 1;
            return Ok(None);
        }
        let mut inner = OplogEntry::decode(&pending.bytes)?;
        inner.ts = entry.ts;
        inner.reply = entry.reply.clone();
        Ok(Some(AssembledWrite {
            entry: inner,
            first_ts: pending.first_ts,
            links: pending.next_index as usize + 1,
        }))
    }

    /// Ends the stream; returns true if an open chain had to be discarded.
    pub fn finish(&mut self) -> bool {
        if self.pending.take().is_some() {
            self.discarded += 1;
            return true;
        }
        false
    }

    pub fn discarded(&self) -> usize {
        self.discarded
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    fn drop_pending(&mut self, at: Timestamp) {
        if let Some(pending) = self.pending.take() {
            warn!(
                first_ts = %pending.first_ts,
                at = %at,
                "discarding incomplete oplog chain"
            );
            self.discarded += 1;
        }
    }
}

/// Assembles a whole ordered slice, discarding a dangling chain at the end.
pub fn assemble_all<'a>(
    entries: impl IntoIterator<Item = &'a OplogEntry>,
) -> Result<Vec<AssembledWrite>, ShardError> {
    let mut assembler = ChainAssembler::new();
    let mut out = Vec::new();
    for entry in entries {
        if let Some(write) = assembler.feed(entry)? {
            out.push(write);
        }
    }
    assembler.finish();
    Ok(out)
}
