// src/cli/handlers/mod.rs

// One module per CLI mode.

pub mod commons;
pub mod job;
pub mod list;
pub mod run;
