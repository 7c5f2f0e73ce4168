//! Side-effecting helpers: filesystem, configuration and agent processes.

pub mod agent;
pub mod backlog_store;
pub mod config;
pub mod process;
pub mod prompt;
