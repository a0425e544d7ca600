//! Runtime glue: configuration, error taxonomy, fatal-error capture, progress
//! journals, telemetry and the top-level scheduler runner.

pub mod config;
pub mod error;
pub mod fatal;
pub mod journal;
pub mod runner;
pub mod telemetry;
