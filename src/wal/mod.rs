pub mod frame;
pub mod log_file;

pub use log_file::{FrameScan, LogFile, scan_frames};
