use thiserror::Error;

/// Stable error taxonomy shared by every coordination-core crate. Each
/// variant carries a `code()` string so HTTP/WS consumers get a stable
/// identifier independent of the Display message.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    #[error("budget exhausted: {0}")]
    BudgetExhausted(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InvalidInput(_) => "invalid_input",
            CoreError::NotFound(_) => "not_found",
            CoreError::Conflict(_) => "conflict",
            CoreError::DependencyUnavailable(_) => "dependency_unavailable",
            CoreError::BudgetExhausted(_) => "budget_exhausted",
            CoreError::DeadlineExceeded(_) => "deadline_exceeded",
            CoreError::Internal(_) => "internal",
        }
    }

    /// Whether a caller may retry the same operation unchanged. Transient
    /// infra failures and deadline misses are retryable; everything else
    /// indicates a request that will fail again identically.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            CoreError::DependencyUnavailable(_) | CoreError::DeadlineExceeded(_)
        )
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::InvalidInput(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_unavailable_is_retryable_but_conflict_is_not() {
        assert!(CoreError::DependencyUnavailable("bus down".into()).retryable());
        assert!(!CoreError::Conflict("file locked".into()).retryable());
    }

    #[test]
    fn code_is_stable_across_message_changes() {
        let a = CoreError::NotFound("task x".into());
        let b = CoreError::NotFound("task y".into());
        assert_eq!(a.code(), b.code());
    }
}
