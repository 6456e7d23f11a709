//! Config - scheduler configuration
//!
//! - `athena.rs` - AthenaConfig (poll interval, retry backoff, paths)

mod athena;

pub use athena::{AthenaConfig, ATHENA_CONFIG_FILE};
