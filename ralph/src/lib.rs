//! Agent loop driver.
//!
//! Repeatedly invokes an external coding agent to complete one story at a time
//! from a dependency-ordered backlog, watches its streamed output for control
//! markers, and decides whether to continue, retry, pause or stop. The crate
//! keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (story scheduling, output
//!   protocol parsing, the iteration state machine). No I/O.
//! - **[`io`]**: Side-effecting operations (backlog file, configuration,
//!   agent processes). Isolated behind the [`io::agent::Agent`] seam so tests
//!   can script agent runs.
//!
//! [`session`] wires the two together: it feeds messages to the controller
//! and executes the effects it returns.

pub mod backlog;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod select;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
