use thiserror::Error;

/// Main error type for the HyperWatch system
#[derive(Error, Debug)]
pub enum HwError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Dependency unresolved: {parameter} depends on {parent}, which has no current value")]
    DependencyUnresolved { parameter: String, parent: String },

    #[error("Termination failure for job {job_id}: {message}")]
    TerminationFailure { job_id: String, message: String },

    #[error("Transient store error: {0}")]
    TransientStore(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: String,
        to: String,
    },

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HwError {
    /// Whether retrying the failed operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, HwError::TransientStore(_))
    }
}

/// Search-algorithm errors
#[derive(Error, Debug)]
pub enum SearchError {
    #[error("Search algorithm used before initialize()")]
    NotInitialized,

    #[error("Unknown trial: {trial_id}")]
    UnknownTrial { trial_id: String },

    #[error("Invalid observation: {message}")]
    InvalidObservation { message: String },

    #[error("Parameter {parameter} has no valid value: {message}")]
    EmptyDomain { parameter: String, message: String },

    #[error("Surrogate model error: {message}")]
    Surrogate { message: String },
}

/// Result type alias for HyperWatch operations
pub type HwResult<T> = Result<T, HwError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::HwError::Configuration(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::HwError::Internal(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = HwError::DependencyUnresolved {
            parameter: "min_lr".to_string(),
            parent: "max_lr".to_string(),
        };

        assert!(error.to_string().contains("min_lr"));
        assert!(error.to_string().contains("max_lr"));
    }

    #[test]
    fn test_error_conversion() {
        let search_error = SearchError::UnknownTrial {
            trial_id: "abc".to_string(),
        };
        let hw_error: HwError = search_error.into();

        match hw_error {
            HwError::Search(_) => (),
            _ => panic!("Expected Search error"),
        }
    }

    #[test]
    fn test_only_store_errors_are_transient() {
        assert!(HwError::TransientStore("timeout".into()).is_transient());
        assert!(!HwError::NotFound("job".into()).is_transient());
        assert!(!config_error!("missing {}", "lr").is_transient());
    }

    #[test]
    fn test_macros() {
        let config_err = config_error!("Missing required parameter: {}", "learning_rate");
        assert!(matches!(config_err, HwError::Configuration(_)));
        let internal_err = internal_error!("Something went wrong");
        assert!(matches!(internal_err, HwError::Internal(_)));
    }
}
