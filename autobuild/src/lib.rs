//! Command execution and control loop for an autonomous build agent.
//!
//! The agent repeatedly asks a decision oracle for one command, runs it in a
//! persistent shell (first a restricted local shell, later a container) and
//! feeds the result back, until the project builds and its tests run.
//!
//! - **[`core`]**: Pure logic: output sanitizing, the safety policy, loop
//!   detection, the context window and the session state machine.
//! - **[`io`]**: Processes, shell hosts, the session controller, the
//!   provisioner, config and transcripts.
//!
//! [`terminal`], [`tools`] and [`control`] tie the two together.

pub mod control;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod terminal;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tools;
