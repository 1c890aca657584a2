//! Supervised event log monitor.
//!
//! One worker task per (host, log) target counts configured event IDs into a
//! shared aggregate. The supervisor respawns dead workers after a fixed delay
//! and periodically exports every target's counters as a JSON snapshot.

pub mod agent;
pub mod aggregate;
pub mod config;
pub mod export;
pub mod source;
pub mod target;
pub mod worker;
