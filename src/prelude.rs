//! Convenience re-exports for library consumers.
//!
//! ```rust,no_run
//! use scenario_triage::prelude::*;
//! ```

// Core
pub use crate::core::config::Config;
pub use crate::core::errors::{ErrorReport, Result, TriageError};
pub use crate::core::paths::PathValidator;

// Runner
pub use crate::runner::orchestrator::{Orchestrator, RunRequest};
pub use crate::runner::resolver::ExecutableResolver;

// Results
pub use crate::results::store::{ResultStore, RunStatus, TestRun};
pub use crate::results::summary::{RunSummary, ScenarioResult, ScenarioStatus, Summarizer};

// Triage
pub use crate::triage::context::{ContextBuilder, ContextRequest, FailureContext};

// Analysis
pub use crate::analysis::analyzer::{Analyzer, Diagnosis};
pub use crate::analysis::rules::{FailureCategory, RuleTable};

// Service
pub use crate::service::{Outcome, TriageService};
