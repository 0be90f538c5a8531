//! Shared types for nbc: the structured error taxonomy, the serialized
//! configuration and state records, path constants, and the image digest
//! primitive.

pub mod config;
pub mod constants;
pub mod digest;
pub mod error;
