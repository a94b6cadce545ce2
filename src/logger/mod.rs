//! Activity logging: append-only JSONL with a shared, cloneable handle.

pub mod activity;
pub mod jsonl;
