//! Render results returned to callers

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Status used for every synthesized failure result
pub const FAILURE_STATUS: u16 = 500;

/// A cookie set by the page during rendering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<JsonValue>,
}

/// Response metadata produced alongside the rendered markup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderContext {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Redirect target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookies: Option<HashMap<String, Cookie>>,
}

impl RenderContext {
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            error: None,
            url: None,
            cookies: None,
        }
    }
}

/// The outcome of a render. Always well formed: failures are expressed
/// through `context.status` and `context.error`, never by absence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderResult {
    pub html: String,
    pub context: RenderContext,
}

impl RenderResult {
    /// A successful render with status 200
    pub fn ok(html: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            context: RenderContext::with_status(200),
        }
    }

    /// `{ html: "", context: { status: 500, error } }`
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            html: String::new(),
            context: RenderContext {
                error: Some(error.into()),
                ..RenderContext::with_status(FAILURE_STATUS)
            },
        }
    }

    pub fn status(&self) -> u16 {
        self.context.status
    }

    pub fn is_success(&self) -> bool {
        self.context.status < FAILURE_STATUS
    }

    pub fn error(&self) -> Option<&str> {
        self.context.error.as_deref()
    }
}
