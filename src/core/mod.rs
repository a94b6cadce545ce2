//! Core types: errors, configuration, path containment.

pub mod config;
pub mod errors;
pub mod paths;
