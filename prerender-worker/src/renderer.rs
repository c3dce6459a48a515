//! Static shell renderer

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use prerender_core::{RenderContext, RenderResult, Renderer};
use serde_json::Value as JsonValue;
use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Shells kept in memory when no capacity is given
pub const DEFAULT_CACHE_CAPACITY: usize = 64;

/// Serves the HTML shell named by a payload's `html_file`.
///
/// This is the path taken for routes that skip server-side rendering: the
/// page is the application shell as-is. `html_file` must be a relative
/// path without `..`; it resolves against the renderer's root when one is
/// set. The most recently served shells are cached by path.
pub struct ShellRenderer {
    root: Option<PathBuf>,
    cache: Mutex<LruCache<PathBuf, Arc<str>>>,
}

impl ShellRenderer {
    pub fn new() -> Self {
        Self::build(None, DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self::build(Some(root.into()), DEFAULT_CACHE_CAPACITY)
    }

    /// Keep at most `capacity` shells in memory. Zero is treated as one.
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache = Mutex::new(LruCache::new(cache_size(capacity)));
        self
    }

    fn build(root: Option<PathBuf>, capacity: usize) -> Self {
        Self {
            root,
            cache: Mutex::new(LruCache::new(cache_size(capacity))),
        }
    }

    fn resolve(&self, html_file: &str) -> Result<PathBuf, String> {
        let relative = Path::new(html_file);
        let confined = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
        if html_file.is_empty() || !confined {
            return Err(format!(
                "html_file {:?} must be a relative path inside the shell root",
                html_file
            ));
        }

        Ok(match &self.root {
            Some(root) => root.join(relative),
            None => relative.to_path_buf(),
        })
    }

    async fn load(&self, path: &Path) -> std::io::Result<Arc<str>> {
        if let Some(html) = self.cache.lock().get(path) {
            return Ok(html.clone());
        }

        let html: Arc<str> = tokio::fs::read_to_string(path).await?.into();
        debug!("Loaded shell {} ({} bytes)", path.display(), html.len());
        self.cache.lock().put(path.to_path_buf(), html.clone());
        Ok(html)
    }

    /// Number of shells held in memory
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }
}

impl Default for ShellRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ShellRenderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cache = self.cache.lock();
        f.debug_struct("ShellRenderer")
            .field("root", &self.root)
            .field("cached", &cache.len())
            .field("capacity", &cache.cap())
            .finish()
    }
}

fn cache_size(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)
}

#[async_trait]
impl Renderer for ShellRenderer {
    async fn render(&self, payload: &JsonValue) -> RenderResult {
        let Some(html_file) = payload.get("html_file").and_then(JsonValue::as_str) else {
            return RenderResult::failure("Payload has no html_file");
        };

        let path = match self.resolve(html_file) {
            Ok(path) => path,
            Err(e) => {
                warn!("Refusing shell request: {}", e);
                return RenderResult::failure(e);
            }
        };

        match self.load(&path).await {
            Ok(html) => RenderResult {
                html: html.to_string(),
                context: RenderContext::with_status(200),
            },
            Err(e) => RenderResult::failure(format!(
                "Failed to read shell {}: {}",
                path.display(),
                e
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn write_shell(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, "{}", body).unwrap();
        path
    }

    #[tokio::test]
    async fn test_serves_and_caches_shell() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_shell(dir.path(), "index.html", "<html><div id=\"root\"></div></html>");

        let renderer = ShellRenderer::with_root(dir.path());
        let result = renderer.render(&json!({"html_file": "index.html"})).await;
        assert_eq!(result.status(), 200);
        assert_eq!(result.html, "<html><div id=\"root\"></div></html>");

        // Served from cache even after the file is gone
        std::fs::remove_file(&path).unwrap();
        let again = renderer.render(&json!({"html_file": "index.html"})).await;
        assert_eq!(again.html, result.html);
        assert_eq!(renderer.cached(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_500() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = ShellRenderer::with_root(dir.path());

        let result = renderer.render(&json!({"html_file": "missing.html"})).await;
        assert_eq!(result.status(), 500);
        assert!(result.error().unwrap().contains("missing.html"));
    }

    #[tokio::test]
    async fn test_payload_without_shell_is_500() {
        let renderer = ShellRenderer::new();
        let result = renderer.render(&json!({"url": "/"})).await;
        assert_eq!(result.error(), Some("Payload has no html_file"));
    }

    #[tokio::test]
    async fn test_paths_outside_root_are_refused() {
        let parent = tempfile::tempdir().unwrap();
        let secret = write_shell(parent.path(), "secret.html", "<p>secret</p>");
        let root = parent.path().join("dist");
        std::fs::create_dir(&root).unwrap();
        write_shell(&root, "index.html", "<p>shell</p>");

        let renderer = ShellRenderer::with_root(&root);
        for html_file in [
            "../secret.html".to_string(),
            "nested/../../secret.html".to_string(),
            secret.display().to_string(),
            String::new(),
        ] {
            let result = renderer.render(&json!({ "html_file": html_file })).await;
            assert_eq!(result.status(), 500, "{:?} was served", html_file);
            assert!(!result.html.contains("secret"));
        }
        assert_eq!(renderer.cached(), 0);

        let shell = renderer.render(&json!({"html_file": "./index.html"})).await;
        assert_eq!(shell.html, "<p>shell</p>");
    }

    #[tokio::test]
    async fn test_cache_keeps_most_recent_shells() {
        let dir = tempfile::tempdir().unwrap();
        for index in 0..5 {
            let name = format!("page-{}.html", index);
            write_shell(dir.path(), &name, &format!("<p>{}</p>", index));
        }

        let renderer = ShellRenderer::with_root(dir.path()).with_cache_capacity(2);
        for index in 0..5 {
            let result = renderer
                .render(&json!({ "html_file": format!("page-{}.html", index) }))
                .await;
            assert_eq!(result.html, format!("<p>{}</p>", index));
            assert!(renderer.cached() <= 2);
        }
        assert_eq!(renderer.cached(), 2);

        // Evicted shells are read from disk again
        std::fs::remove_file(dir.path().join("page-0.html")).unwrap();
        std::fs::remove_file(dir.path().join("page-4.html")).unwrap();
        assert_eq!(
            renderer.render(&json!({"html_file": "page-0.html"})).await.status(),
            500
        );
        assert_eq!(
            renderer.render(&json!({"html_file": "page-4.html"})).await.html,
            "<p>4</p>"
        );
    }
}
