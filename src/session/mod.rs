mod store;
mod types;

pub use store::{SessionCheckout, SessionStore};
pub use types::{SessionId, SessionWriteRecord, TxnNumber, WriteReply};
