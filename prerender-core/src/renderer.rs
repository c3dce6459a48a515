//! The opaque render capability hosted by a worker

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::result::RenderResult;

/// Turns a job payload into a [`RenderResult`].
///
/// Implementations own whatever state rendering needs (templates, route
/// tables, script engines). The pool never inspects the payload. A renderer
/// must be total: failures it can observe are encoded as results, typically
/// via [`RenderResult::failure`].
#[async_trait]
pub trait Renderer: Send + Sync + 'static {
    /// Render one payload
    async fn render(&self, payload: &JsonValue) -> RenderResult;

    /// Memory attributable to this renderer, in bytes.
    ///
    /// Renderers that can measure their own heap (for example an embedded
    /// script engine) report it here; `None` falls back to the resident size
    /// of the hosting process.
    fn memory_usage(&self) -> Option<u64> {
        None
    }
}
