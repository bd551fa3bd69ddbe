use thiserror::Error;

/// Errors from workflow store operations (used by trait definitions in weft-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("entity not found")]
    NotFound,

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Errors reported by the execution-unit collaborator.
#[derive(Debug, Error)]
pub enum UnitError {
    #[error("unit '{0}' not found")]
    NotFound(String),

    #[error("unit '{name}' rejected: {reason}")]
    Rejected { name: String, reason: String },

    #[error("execution backend unavailable: {0}")]
    Unavailable(String),
}

/// Malformed duration strings.
#[derive(Debug, Error)]
pub enum DurationError {
    #[error("empty duration")]
    Empty,

    #[error("invalid duration '{0}'")]
    Invalid(String),

    #[error("duration '{0}' is missing a unit")]
    MissingUnit(String),

    #[error("unknown duration unit '{0}'")]
    UnknownUnit(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_error_display() {
        let err = UnitError::Rejected {
            name: "wf-123".to_string(),
            reason: "pvc create error".to_string(),
        };
        assert_eq!(err.to_string(), "unit 'wf-123' rejected: pvc create error");
    }

    #[test]
    fn test_repository_error_display() {
        let err = RepositoryError::Conflict("weft/hello".to_string());
        assert_eq!(err.to_string(), "conflict: weft/hello");
    }
}
