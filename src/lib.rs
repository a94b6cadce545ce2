#![forbid(unsafe_code)]

//! Scenario triage: runs a behave suite as a subprocess, keeps a bounded
//! history of its structured results, and explains failures.
//!
//! Layers, leaf first:
//! 1. **Runner**: executable resolution, bounded subprocess supervision,
//!    run orchestration with unique run ids
//! 2. **Results**: report model, scenario summarization, the on-disk store
//!    with retention
//! 3. **Triage**: failure context (step definition, related code, logs,
//!    screenshot, environment) with a process-local cache
//! 4. **Analysis**: an ordered rule table that categorizes a failure, plus
//!    fix suggestions
//!
//! # Library usage
//!
//! Use the [`prelude`] for convenient access to the most common types:
//!
//! ```rust,no_run
//! use scenario_triage::prelude::*;
//!
//! let config = Config::load(None)?;
//! let service = TriageService::new(config);
//! let last = service.get_last_results()?;
//! # Ok::<(), scenario_triage::core::errors::TriageError>(())
//! ```

pub mod prelude;

pub mod analysis;
pub mod core;
pub mod features;
pub mod logger;
pub mod results;
pub mod runner;
pub mod service;
pub mod triage;
