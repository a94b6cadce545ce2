//! Failure analysis: rule-based categorization, fix suggestions, and the
//! analyzer that ties them to a failure context.

pub mod analyzer;
pub mod rules;
pub mod suggestions;
