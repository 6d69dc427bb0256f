use std::fmt;

use thiserror::Error;

/// Stable classification for an [`EncliiError`], independent of the human message.
///
/// Callers that need to map an error onto an external contract (an HTTP status, an
/// exit code, a retry policy) switch on this instead of matching the error variant
/// directly, so new context fields never become a breaking match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Unauthorized,
    Forbidden,
    Upstream,
    Timeout,
    Cancelled,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// Crate-level error type for operations whose failure mode a caller needs to branch on.
///
/// Internal plumbing that only needs a context chain keeps using `anyhow::Result`;
/// `EncliiError` sits at the seams that cross into a caller-visible contract (store,
/// reconciler, domain controller public methods).
#[derive(Debug, Error)]
#[error("{kind}: {message}{}", format_context(.context))]
pub struct EncliiError {
    pub kind: ErrorKind,
    pub message: String,
    pub context: Vec<(&'static str, String)>,
    #[source]
    pub source: Option<anyhow::Error>,
}

fn format_context(context: &[(&'static str, String)]) -> String {
    if context.is_empty() {
        String::new()
    } else {
        let parts: Vec<String> = context.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!(" ({})", parts.join(", "))
    }
}

impl EncliiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: Vec::new(),
            source: None,
        }
    }

    pub fn from_anyhow(kind: ErrorKind, err: anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            kind,
            context: Vec::new(),
            source: Some(err),
        }
    }

    pub fn with_context(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Upstream, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<sqlx::Error> for EncliiError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::new(ErrorKind::NotFound, "row not found"),
            _ => Self::from_anyhow(ErrorKind::Internal, err.into()),
        }
    }
}

/// Mirrors the ergonomics of attaching an [`ErrorKind`] to an arbitrary `anyhow::Error`
/// without writing `EncliiError::from_anyhow(kind, err.into())` at every call site.
pub trait ResultExt<T> {
    fn into_kind(self, kind: ErrorKind, message: impl Into<String>) -> Result<T, EncliiError>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: Into<anyhow::Error>,
{
    fn into_kind(self, kind: ErrorKind, message: impl Into<String>) -> Result<T, EncliiError> {
        self.map_err(|e| {
            let err: anyhow::Error = e.into();
            EncliiError::from_anyhow(kind, err).with_context("detail", message.into())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_kind_and_message() {
        let err = EncliiError::validation("bad sha").with_context("field", "git_sha");
        let rendered = err.to_string();
        assert!(rendered.contains("validation"));
        assert!(rendered.contains("bad sha"));
        assert!(rendered.contains("field=git_sha"));
    }

    #[test]
    fn row_not_found_maps_to_not_found_kind() {
        let err: EncliiError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }
}
