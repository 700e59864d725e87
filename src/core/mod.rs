// src/core/mod.rs

pub mod commands;
pub mod document;
pub mod engine;
pub mod invoker;
pub mod job;
pub mod process_info;
pub mod registry;
pub mod run_log;
pub mod template;
pub mod toolkit;
pub mod user_code;
pub mod variables;
