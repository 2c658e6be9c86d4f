//! Error taxonomy for tile rendering.
//!
//! Executor failures fall into exactly two kinds: the query exceeded its
//! configured time budget, or anything else. The executor owns enforcement
//! of the budget; this module only recognizes the resulting error shape.

use thiserror::Error;

/// Tag prepended to non-timeout failures so upstream logs can attribute
/// them to this renderer.
pub const RENDERER_TAG: &str = "PgMvtRenderer";

/// PostgreSQL SQLSTATE raised when a statement is canceled, which is how
/// `statement_timeout` surfaces.
const QUERY_CANCELED: &str = "57014";

/// A failed render, as seen by callers.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RenderError {
    /// The executor's time budget was exceeded. The message is stable so
    /// that upstream HTTP mapping can key off it.
    #[error("Render timed out")]
    Timeout,

    /// Any other executor failure: syntax, connectivity, constraint.
    #[error("{0}")]
    Query(String),
}

/// Raw failure reported by a [`QueryExecutor`](crate::QueryExecutor).
///
/// `code` carries the database error code when one exists (e.g. a
/// PostgreSQL SQLSTATE), which is the preferred timeout marker.
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct ExecutorError {
    pub message: String,
    pub code: Option<String>,
}

impl ExecutorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: Some(code.into()),
        }
    }

    /// Whether this failure indicates the executor's time budget ran out.
    pub fn is_timeout(&self) -> bool {
        self.code.as_deref() == Some(QUERY_CANCELED)
            || self.message.contains("statement timeout")
    }
}

/// Classifies an executor failure per the render error taxonomy.
///
/// Timeouts surface with the literal stable message; everything else keeps
/// the underlying database message behind the renderer tag.
pub fn classify(error: ExecutorError) -> RenderError {
    if error.is_timeout() {
        RenderError::Timeout
    } else {
        RenderError::Query(format!("{}: {}", RENDERER_TAG, error.message))
    }
}

/// Failure loading a layer definition.
#[derive(Debug, Error)]
pub enum LayerSpecError {
    #[error("Invalid YAML in layer spec.")]
    Yaml(#[from] serde_yaml::Error),
}

/// Failure while composing the final query string.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SubstitutionError {
    /// A `{name}` placeholder in the outer query template had no supplied
    /// value. This is a programming error in the caller's attribute map,
    /// not a runtime condition, and must fail before the query is issued.
    #[error("no value supplied for query placeholder {{{0}}}")]
    MissingPlaceholder(String),
}
