//! Shared helpers for binaries and long-lived tasks.

pub mod bootstrap;
pub mod retry;
