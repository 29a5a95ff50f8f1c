pub mod config_parser;
pub mod exception_tracker;
pub mod log_streamer;
pub mod process_manager;
pub mod pty;
pub mod restart_policy;

pub use config_parser::*;
pub use exception_tracker::*;
pub use log_streamer::*;
pub use process_manager::*;
pub use restart_policy::*;
