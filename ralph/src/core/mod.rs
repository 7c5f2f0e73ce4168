//! Deterministic, pure logic of the loop driver.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! values and return deterministic outputs suitable for tests; the
//! [`controller`] in particular turns messages into effects without
//! performing any of them.

pub mod controller;
pub mod events;
pub mod scheduler;
pub mod signals;
pub mod types;
pub mod watcher;
