pub mod ansi;
pub mod line_buffer;
pub mod process_killer;

#[cfg(not(target_os = "windows"))]
pub mod user_path;

pub use ansi::*;
pub use line_buffer::*;
pub use process_killer::*;

#[cfg(not(target_os = "windows"))]
pub use user_path::*;
