//! Execution backends
//!
//! A backend launches task processes and reports their lifecycle back to
//! the scheduler through a registered `TaskCallback`:
//! - `LocalBackend` - runs commands on this host with live log capture

pub mod kill;
pub mod local;
pub mod r#trait;

pub use kill::KillHandle;
pub use local::LocalBackend;
pub use r#trait::{ExecutionBackend, OnKilled, TaskCallback};
