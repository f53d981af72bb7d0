use std::fmt::Display;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SolveError>;

/// Errors thrown across the contract/solver boundary.
///
/// Precheck problems are not errors: they are returned as a list of
/// [`crate::precheck::PrecheckIssue`] so a caller can show all of them at once.
#[derive(Debug, Error)]
pub enum SolveError {
    /// Malformed or unreadable request/mesh/result data.
    #[error("Contract error: {0}")]
    Contract(String),

    /// Cooperative cancellation honored by a solver (or by the orchestrator
    /// before the solver started).
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The registry could not resolve a solver selector.
    #[error("Solver import error: {0}")]
    SolverImport(String),

    /// Any other failure raised inside `solve`.
    #[error("Solver error: {0}")]
    SolverRuntime(String),

    /// Singular or ill-conditioned global system (rigid-body modes).
    #[error("Singular system: {0}")]
    Singular(String),

    #[error("I/O error ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl SolveError {
    /// Stable string code attached to diagnostics bundles and batch reports.
    pub fn code(&self) -> &'static str {
        match self {
            SolveError::Contract(_) => "CONTRACT",
            SolveError::Cancelled(_) => "CANCELED",
            SolveError::SolverImport(_) => "SOLVER_IMPORT",
            SolveError::SolverRuntime(_) => "SOLVER_RUNTIME",
            SolveError::Singular(_) => "SOLVER_SINGULAR",
            SolveError::Io { source, .. } => match source.kind() {
                std::io::ErrorKind::NotFound => "IO_NOT_FOUND",
                std::io::ErrorKind::PermissionDenied => "IO_PERMISSION",
                _ => "IO",
            },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SolveError::Cancelled(_))
    }

    /// Builds a `map_err` adapter that wraps an `io::Error` with context.
    pub fn io(context: impl Display) -> impl FnOnce(std::io::Error) -> SolveError {
        let context = context.to_string();
        move |source| SolveError::Io { context, source }
    }

    pub fn info(&self) -> ErrorInfo {
        ErrorInfo {
            code: self.code().to_owned(),
            message: self.to_string(),
        }
    }
}

/// Code used when a run is blocked by precheck issues of ERROR severity.
pub const PRECHECK_CODE: &str = "PRECHECK";

/// A mapped error: stable code plus human readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: impl AsRef<str>, message: impl Into<String>) -> ErrorInfo {
        ErrorInfo {
            code: normalize_error_code(code.as_ref()),
            message: message.into(),
        }
    }
}

impl Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

/// Normalizes an arbitrary (possibly solver supplied) code into
/// `UPPER_SNAKE_CASE` made of ASCII alphanumerics and underscores.
pub fn normalize_error_code(code: &str) -> String {
    let mut normalized = String::with_capacity(code.len());
    let mut last_was_sep = true;
    for ch in code.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            normalized.push(ch.to_ascii_uppercase());
            last_was_sep = false;
        } else if !last_was_sep {
            normalized.push('_');
            last_was_sep = true;
        }
    }
    while normalized.ends_with('_') {
        normalized.pop();
    }

    if normalized.is_empty() {
        "UNKNOWN".to_owned()
    } else {
        normalized
    }
}

/// Process exit status used by the CLI for a given error code.
pub fn exit_status(code: &str) -> i32 {
    match code {
        "CONTRACT" => 2,
        PRECHECK_CODE => 3,
        "SOLVER_IMPORT" => 4,
        "SOLVER_RUNTIME" => 5,
        "SOLVER_SINGULAR" => 6,
        "IO" | "IO_NOT_FOUND" | "IO_PERMISSION" => 7,
        "CANCELED" => 130,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(SolveError::Contract("x".into()).code(), "CONTRACT");
        assert_eq!(SolveError::Cancelled("x".into()).code(), "CANCELED");
        assert_eq!(SolveError::SolverImport("x".into()).code(), "SOLVER_IMPORT");
        assert_eq!(SolveError::SolverRuntime("x".into()).code(), "SOLVER_RUNTIME");
        assert_eq!(SolveError::Singular("x".into()).code(), "SOLVER_SINGULAR");

        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        assert_eq!(SolveError::io("reading")(missing).code(), "IO_NOT_FOUND");
    }

    #[test]
    fn normalizes_external_codes() {
        assert_eq!(normalize_error_code("  diverged-step 3 "), "DIVERGED_STEP_3");
        assert_eq!(normalize_error_code("a..b__c"), "A_B_C");
        assert_eq!(normalize_error_code("--"), "UNKNOWN");
        assert_eq!(normalize_error_code(""), "UNKNOWN");
    }

    #[test]
    fn exit_status_distinguishes_failures() {
        assert_eq!(exit_status("CANCELED"), 130);
        assert_eq!(exit_status(PRECHECK_CODE), 3);
        assert_ne!(exit_status("SOLVER_SINGULAR"), exit_status("SOLVER_RUNTIME"));
    }
}
