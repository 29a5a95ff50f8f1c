pub mod exception;
pub mod log_entry;
pub mod process_info;
pub mod terminal;

pub use exception::*;
pub use log_entry::*;
pub use process_info::*;
pub use terminal::*;
