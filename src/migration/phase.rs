use crate::error::ShardError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MigrationPhase {
    Cloning,
    CatchingUpOplog,
    CriticalSection,
    Committed,
    Aborted,
}

const LEGAL_TRANSITIONS: &[(MigrationPhase, MigrationPhase)] = &[
    (MigrationPhase::Cloning, MigrationPhase::CatchingUpOplog),
    (MigrationPhase::Cloning, MigrationPhase::Aborted),
    (MigrationPhase::CatchingUpOplog, MigrationPhase::CriticalSection),
    (MigrationPhase::CatchingUpOplog, MigrationPhase::Aborted),
    (MigrationPhase::CriticalSection, MigrationPhase::Committed),
    (MigrationPhase::CriticalSection, MigrationPhase::Aborted),
];

impl MigrationPhase {
    pub fn can_transition_to(self, next: MigrationPhase) -> bool {
        LEGAL_TRANSITIONS.contains(&(self, next))
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MigrationPhase::Committed | MigrationPhase::Aborted)
    }

    pub fn transition(self, next: MigrationPhase) -> Result<MigrationPhase, ShardError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(ShardError::IllegalTransition {
                from: self,
                to: next,
            })
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MigrationPhase::Cloning => "cloning",
            MigrationPhase::CatchingUpOplog => "catchingUpOplog",
            MigrationPhase::CriticalSection => "criticalSection",
            MigrationPhase::Committed => "committed",
            MigrationPhase::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::MigrationPhase::{self, *};

    const ALL: [MigrationPhase; 5] = [Cloning, CatchingUpOplog, CriticalSection, Committed, Aborted];

    #[test]
    fn terminal_phases_have_no_exits() {
        for from in [Committed, Aborted] {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn every_live_phase_can_abort_but_phases_cannot_be_skipped() {
        for from in [Cloning, CatchingUpOplog, CriticalSection] {
            assert!(from.can_transition_to(Aborted));
        }
        assert!(!Cloning.can_transition_to(CriticalSection));
        assert!(!CatchingUpOplog.can_transition_to(Committed));
        let err = Cloning.transition(Committed).expect_err("skip");
        assert_eq!(err.code_str(), "illegal_transition");
        assert_eq!(
            err.to_string(),
            "illegal migration transition cloning -> committed"
        );
    }
}
