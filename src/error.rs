use std::fmt;
use thiserror::Error;

// ---------------------------------------------------------------------------
// ValidationError / ValidationErrors
// ---------------------------------------------------------------------------

/// A single field-level validation failure.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Dot/bracket path to the failing value, e.g. `"owner[1].id"`.
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }

    /// The top-level field the path belongs to (`"owner[1].id"` → `"owner"`).
    pub fn root_field(&self) -> &str {
        let end = self
            .path
            .find(['.', '['])
            .unwrap_or(self.path.len());
        &self.path[..end]
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, r#"Validation failed at "{}": {}"#, self.path, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// A collection of one or more `ValidationError`s.
#[derive(Debug, Clone)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Validation failed:")?;
        for e in &self.0 {
            write!(f, "\n  - {}: {}", e.path, e.message)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

// ---------------------------------------------------------------------------
// TransactError
// ---------------------------------------------------------------------------

/// A rejected write transaction from the database client. Writes are never
/// retried here — a stale retry could violate the snapshot-baseline diffing
/// invariant — so this surfaces to the caller as-is.
#[derive(Debug, Clone, Error)]
#[error("Transaction failed: {0}")]
pub struct TransactError(pub String);

impl TransactError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

// ---------------------------------------------------------------------------
// FormError — top-level rollup
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum FormError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Transact(#[from] TransactError),

    #[error("Unknown entity \"{0}\" in schema")]
    UnknownEntity(String),

    #[error("Form is in {actual} mode; operation requires {expected} mode")]
    WrongMode {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Form has been disposed")]
    Disposed,
}

/// Convenience alias — the default error type is `FormError`.
pub type Result<T, E = FormError> = std::result::Result<T, E>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
