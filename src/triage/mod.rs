//! Failure triage: everything gathered about one failing scenario.

pub mod context;
pub mod logs;
pub mod screenshots;
pub mod stepdefs;
