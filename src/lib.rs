// src/lib.rs

//! # mdcs
//!
//! A configuration-driven workflow orchestrator for mosaic datasets. An XML
//! configuration names a dataset, its processing parameters and a chain of
//! short command codes (`CM+AF+AR+BF`); the engine resolves each code to an
//! operation, feeds it its parameters and records a result per step.
//!
//! The geoprocessing itself happens in an external toolkit reached through
//! [`core::toolkit::Toolkit`]; user-defined commands come in through
//! [`core::user_code::UserCode`].

pub mod cli;
pub mod constants;
pub mod core;
pub mod models;
pub mod system;
