//! Test-runner execution: locating the runner, supervising it, and turning
//! one invocation into a persisted run.

pub mod orchestrator;
pub mod process;
pub mod resolver;
