//! Logging setup shared by the `af` binary and the background daemon.

pub mod logging;
