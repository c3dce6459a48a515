//! Core domain types for prerender
//!
//! This crate contains the types shared between the pool coordinator and
//! the render workers: jobs and their memory budgets, correlation ids,
//! render results, and the opaque [`Renderer`] capability a worker hosts.

pub mod job;
pub mod memory;
pub mod renderer;
pub mod result;

// Re-export commonly used types at the crate root
pub use job::{CorrelationId, MemoryBudget, RenderJob, DEFAULT_MAX_MEMORY_MB};
pub use memory::MemoryProbe;
pub use renderer::Renderer;
pub use result::{Cookie, RenderContext, RenderResult};
