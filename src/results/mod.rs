//! Run artifacts: the report model, the summarizer, and the on-disk store.

pub mod report;
pub mod store;
pub mod summary;
