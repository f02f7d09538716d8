pub mod coordinator;
pub mod cursor;
pub mod phase;
pub mod pump;

pub use coordinator::{MigrationCoordinator, MigrationHooks, MigrationStatus, PausePoint};
pub use cursor::SessionCursorTable;
pub use phase::MigrationPhase;
pub use pump::{FetchControl, PumpProgress, SessionPump};
