//! Side-effecting pieces: processes, shells, containers, files, the oracle.

pub mod config;
pub mod file_log;
pub mod host;
pub mod oracle;
pub mod process;
pub mod prompt;
pub mod provisioner;
pub mod session;
pub mod transcript;
