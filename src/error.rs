//! Error types for lineage extraction.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that abort analysis of a statement or a catalog load.
///
/// Everything the resolver can recover from locally (unknown aliases,
/// ambiguous tables, missing catalog rows) is not an error; see
/// [`crate::Warning`] for conditions that are reported without failing.
#[derive(Debug, Error)]
pub enum LineageError {
    /// SQL parsing failed
    #[error("SQL parsing failed: {0}")]
    Parse(String),

    /// The configured dialect name is not known to sqlparser
    #[error("Unknown SQL dialect: {0}")]
    UnknownDialect(String),

    /// An object name the lowering step cannot express
    #[error("Unsupported object name: {0}")]
    UnsupportedName(String),

    /// CTEs in one WITH clause reference each other
    #[error("CTE dependency cycle: {}", .names.join(" -> "))]
    CteCycle { names: Vec<String> },

    /// Catalog file could not be read
    #[error("Failed to read catalog {path:?}: {source}")]
    CatalogIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Catalog file could not be decoded
    #[error("Invalid catalog data: {0}")]
    CatalogFormat(String),
}

impl From<sqlparser::parser::ParserError> for LineageError {
    fn from(err: sqlparser::parser::ParserError) -> Self {
        LineageError::Parse(err.to_string())
    }
}

/// A specialized Result type for lineage operations.
pub type Result<T> = std::result::Result<T, LineageError>;
