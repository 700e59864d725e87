//! # System Interaction Layer
//!
//! Everything that touches the operating system: spawning processes, the
//! manifest-backed toolkit and user scripts, subordinate engine runs and
//! lock-file waits.
//!
//! - **`executor`**: splits manifest command lines and runs them, capturing stdout.
//! - **`tool_manifest`**: a [`crate::core::toolkit::Toolkit`] declared in `toolkit.toml`.
//! - **`user_scripts`**: user functions and job namespaces declared in `user_code.toml`.
//! - **`subordinate`**: launches this binary for a job's engine step.
//! - **`locks`**: waits for this process's geodatabase locks to clear.

pub mod executor;
pub mod locks;
pub mod subordinate;
pub mod tool_manifest;
pub mod user_scripts;
