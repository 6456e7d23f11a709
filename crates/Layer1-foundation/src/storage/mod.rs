//! Storage module for Athena
//!
//! - `json`: raw JSON of the global and project config files

mod json;

pub use json::JsonStore;
