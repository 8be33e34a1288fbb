//! Execution engine for block-based test suites.
//!
//! Suites are JSON documents composed of blocks (navigate, click,
//! assert, HTTP request, control flow, ...). The engine schedules and
//! executes every block of a test file against browser and HTTP
//! capabilities, enforcing lifecycle hooks, data-driven expansion,
//! procedure invocation, soft assertions, and cancellation, and emits a
//! structured [`report::SuiteReport`].
//!
//! Hosts call [`run_suite`] with a [`RunRequest`]; the browser driver is
//! supplied as a [`capability::PageFactory`] implementation.

pub mod blocks;
pub mod capability;
pub mod context;
pub mod errors;
pub mod hooks;
pub mod loader;
pub mod procedures;
pub mod protocol;
pub mod registry;
pub mod report;
pub mod scheduler;
pub mod telemetry;
pub mod template;
pub mod validation;

pub use errors::EngineError;
pub use protocol::{RunOptions, RunRequest};
pub use report::SuiteReport;
pub use scheduler::run_suite;
