use crate::oplog::Timestamp;
use crate::session::SessionId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fetch position of the session-history pump.
///
/// `sessions` holds the last donor timestamp imported per session;
/// `scanned` is how far the donor oplog has been searched for sessions
/// touching the range. Both only move forward.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCursorTable {
    sessions: BTreeMap<SessionId, Timestamp>,
    scanned: Timestamp,
}

impl SessionCursorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts following `session` from the beginning of its history.
    pub fn track(&mut self, session: SessionId) -> bool {
        if self.sessions.contains_key(&session) {
            return false;
        }
        self.sessions.insert(session, Timestamp::ZERO);
        true
    }

    pub fn get(&self, session: SessionId) -> Option<Timestamp> {
        self.sessions.get(&session).copied()
    }

    pub fn advance(&mut self, session: SessionId, ts: Timestamp) {
        let cursor = self.sessions.entry(session).or_default();
        if ts > *cursor {
            *cursor = ts;
        }
    }

    pub fn scanned(&self) -> Timestamp {
        self.scanned
    }

    pub fn advance_scan(&mut self, ts: Timestamp) {
        if ts > self.scanned {
            self.scanned = ts;
        }
    }

    pub fn sessions(&self) -> impl Iterator<Item = (SessionId, Timestamp)> + '_ {
        self.sessions.iter().map(|(s, ts)| (*s, *ts))
    }

    pub fn snapshot(&self) -> BTreeMap<SessionId, Timestamp> {
        self.sessions.clone()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::SessionCursorTable;
    use crate::oplog::Timestamp;
    use crate::session::SessionId;

    #[test]
    fn cursors_never_move_backwards() {
        let mut table = SessionCursorTable::new();
        let session = SessionId::new();
        assert!(table.track(session));
        assert!(!table.track(session));
        table.advance(session, Timestamp::new(5, 2));
        table.advance(session, Timestamp::new(5, 1));
        assert_eq!(table.get(session), Some(Timestamp::new(5, 2)));
        table.advance_scan(Timestamp::new(9, 1));
        table.advance_scan(Timestamp::new(1, 1));
        assert_eq!(table.scanned(), Timestamp::new(9, 1));
    }
}
