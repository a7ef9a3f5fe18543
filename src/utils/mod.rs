//! Shared helpers: retry schedules and process bootstrap.

pub mod bootstrap;
pub mod retry;
