//! # athena-foundation
//!
//! Foundation layer for Athena:
//! - Error: shared error type and `Result` alias
//! - Config: `AthenaConfig` (global + project JSON files)
//! - Storage: `JsonStore` (global and project config lookup)

pub mod config;
pub mod error;
pub mod storage;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config
// ============================================================================
pub use config::{AthenaConfig, ATHENA_CONFIG_FILE};

// ============================================================================
// Storage
// ============================================================================
pub use storage::JsonStore;
