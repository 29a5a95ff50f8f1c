//! Local development process supervisor: runs a set of processes (optionally
//! under a pseudo-terminal), restarts them on crash, keeps their output in a
//! searchable ring buffer and aggregates the exceptions they log.

pub mod error;
pub mod models;
pub mod plugins;
pub mod services;
pub mod state;
pub mod utils;

pub use error::{Result, SupervisorError};
pub use plugins::{FrameworkPlugin, PlainTextPlugin, RailsPlugin};
pub use services::{
    ConfigParser, ExceptionTracker, LogFilter, LogStreamer, ManagerSettings, ProcessEvents,
    ProcessManager, SupervisorConfig,
};
pub use state::Supervisor;
