//! Worker-process side of the prerender pool
//!
//! A worker process reads render jobs from stdin, renders each on its own
//! task, and writes replies to stdout. Alongside every reply it reports
//! whether its memory usage reached the job's budget, so the pool can
//! recycle it.

pub mod cli;
pub mod logging;
pub mod renderer;
pub mod runtime;

pub use renderer::ShellRenderer;
pub use runtime::{report_startup_failure, WorkerRuntime};
