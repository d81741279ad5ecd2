//! Deterministic, pure logic shared by the agent.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod context_window;
pub mod policy;
pub mod repetition;
pub mod response;
pub mod sanitize;
pub mod state;
pub mod types;
