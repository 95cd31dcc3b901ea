/*!
 * Error handling for billing ingestion and query operations
 *
 * Provides detailed error types with context, suggestions, and recovery guidance.
 */

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Library result type
pub type Result<T> = std::result::Result<T, BillingError>;

/// Error types with context and suggestions
#[derive(Error, Debug)]
pub enum BillingError {
    /// File I/O errors with context
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
        context: ErrorContext,
    },

    /// CSV errors that prevent reading the extract any further
    #[error("CSV parsing error at line {line:?}: {message}")]
    CsvParse {
        message: String,
        line: Option<usize>,
        context: ErrorContext,
    },

    /// Data validation errors with detailed information
    #[error("Data validation error: {message}")]
    DataValidation {
        message: String,
        field: Option<String>,
        value: Option<String>,
        context: ErrorContext,
    },

    /// File not found with suggestions
    #[error("File not found: {path}")]
    FileNotFound {
        path: PathBuf,
        suggestion: String,
    },

    /// Storage (SQLite) errors outside of batch inserts
    #[error("Storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: rusqlite::Error,
    },

    /// A billing record batch failed to commit; earlier batches stay committed
    #[error("Batch {batch_index} failed after {rows_committed} billing records were committed: {source}")]
    BatchInsert {
        batch_index: usize,
        rows_committed: usize,
        #[source]
        source: Box<BillingError>,
    },

    /// The ingestion job exceeded its time limit
    #[error("Ingestion timed out during {stage} after {elapsed:?} (limit {limit:?})")]
    IngestTimeout {
        stage: String,
        elapsed: Duration,
        limit: Duration,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        suggestion: Option<String>,
    },

    /// Generic errors with custom message
    #[error("{message}")]
    Custom {
        message: String,
        suggestion: Option<String>,
    },
}

/// Error context providing additional information
#[derive(Debug, Default, Clone)]
pub struct ErrorContext {
    pub file_path: Option<PathBuf>,
    pub line_number: Option<usize>,
    pub column_name: Option<String>,
    pub record_npi: Option<String>,
}

impl BillingError {
    /// Create a file not found error with helpful suggestion
    pub fn file_not_found_with_suggestion(path: PathBuf) -> Self {
        let suggestion = if path.extension().and_then(|e| e.to_str()) == Some("csv") {
            format!(
                "Check if the extract exists at '{}'. CMS publishes the \"Medicare Physician & Other \
                Practitioners - by Provider and Service\" file at https://data.cms.gov",
                path.display()
            )
        } else {
            format!(
                "Check if the file exists at '{}'. Make sure the path is correct and you have read permissions.",
                path.display()
            )
        };

        Self::FileNotFound { path, suggestion }
    }

    /// Wrap a failure that happened while committing a billing record batch
    pub fn batch_failed(batch_index: usize, rows_committed: usize, source: BillingError) -> Self {
        Self::BatchInsert {
            batch_index,
            rows_committed,
            source: Box::new(source),
        }
    }

    /// Wrap a storage error with a message describing the failed step
    pub fn storage(message: impl Into<String>, source: rusqlite::Error) -> Self {
        Self::Storage {
            message: message.into(),
            source,
        }
    }

    /// Number of billing records durably committed before this error, if known
    pub fn rows_committed(&self) -> Option<usize> {
        match self {
            Self::BatchInsert { rows_committed, .. } => Some(*rows_committed),
            _ => None,
        }
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            Self::FileNotFound { suggestion, .. } => {
                format!("{}\n\nSuggestion: {}", self, suggestion)
            }
            Self::BatchInsert { .. } => {
                format!(
                    "{}\n\nThe database holds a partial load. Re-run the ingestion to replace it.",
                    self
                )
            }
            Self::IngestTimeout { .. } => {
                format!("{}\n\nRaise `ingest_timeout_secs` in the configuration or disable it.", self)
            }
            Self::Configuration { suggestion: Some(sug), .. }
            | Self::Custom { suggestion: Some(sug), .. } => {
                format!("{}\n\nSuggestion: {}", self, sug)
            }
            _ => self.to_string(),
        }
    }
}

// Convenience conversions
impl From<std::io::Error> for BillingError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: err,
            context: ErrorContext::default(),
        }
    }
}

impl From<csv::Error> for BillingError {
    fn from(err: csv::Error) -> Self {
        let line = err.position().map(|pos| pos.line() as usize);

        Self::CsvParse {
            message: err.to_string(),
            line,
            context: ErrorContext::default(),
        }
    }
}

impl From<rusqlite::Error> for BillingError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<config::ConfigError> for BillingError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration {
            message: err.to_string(),
            suggestion: Some("Check the config file and MEDBILL_* environment variables".to_string()),
        }
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        Self::Custom {
            message: format!("JSON serialization failed: {}", err),
            suggestion: None,
        }
    }
}
