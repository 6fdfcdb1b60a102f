//! CLI error types and exit codes

use protheus_mirror::{MirrorError, SourceError};
use thiserror::Error;

/// Exit codes for the CLI
/// - 0: Success
/// - 1: General error
/// - 3: ERP unreachable
/// - 4: Validation error
/// - 5: Run conflict (another run active, or an orphaned run)
/// - 6: Run finished as failed or terminated
pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Mirror(#[from] MirrorError),

    #[error("Run {run_id} finished as {state}")]
    RunUnsuccessful { run_id: String, state: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Validation(_) | CliError::NotFound(_) => 4,
            CliError::RunUnsuccessful { .. } => 6,
            CliError::Mirror(e) => match e {
                MirrorError::Connectivity { .. } => 3,
                MirrorError::InvalidConfig { .. }
                | MirrorError::TableNotFound(_)
                | MirrorError::RunNotFound(_)
                | MirrorError::RecordNotFound { .. }
                | MirrorError::Protected { .. } => 4,
                MirrorError::ConcurrencyConflict { .. }
                | MirrorError::OrphanedRun { .. }
                | MirrorError::NoActiveRun { .. }
                | MirrorError::InvalidState { .. } => 5,
                _ => 1,
            },
            CliError::Config(_) | CliError::Io(_) | CliError::Json(_) => 1,
        }
    }

    /// Print the error to stderr with appropriate formatting
    pub fn print(&self) {
        let use_color = std::env::var("NO_COLOR").is_err();

        if use_color {
            eprintln!("\x1b[31mError:\x1b[0m {self}");
        } else {
            eprintln!("Error: {self}");
        }

        if let Some(suggestion) = self.suggestion() {
            if use_color {
                eprintln!("\n\x1b[33mSuggestion:\x1b[0m {suggestion}");
            } else {
                eprintln!("\nSuggestion: {suggestion}");
            }
        }
    }

    /// Get a suggested action for this error
    fn suggestion(&self) -> Option<&'static str> {
        match self {
            CliError::Mirror(MirrorError::OrphanedRun { .. }) => {
                Some("Run 'mirrorctl finalize <table>' to close the orphaned run.")
            }
            CliError::Mirror(MirrorError::ConcurrencyConflict { .. }) => Some(
                "Wait for the active run, or stop it with 'mirrorctl terminate <table>'.",
            ),
            CliError::Mirror(MirrorError::Connectivity { .. }) => {
                Some("Check ERP_BASE_URL and that the ERP REST service is up.")
            }
            CliError::Mirror(MirrorError::SchemaDrift { .. }) => {
                Some("Run 'mirrorctl fix-flags <table>' to add the missing columns.")
            }
            _ => None,
        }
    }
}

impl From<SourceError> for CliError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::InvalidConfiguration { message } => CliError::Config(message),
            other => CliError::Mirror(other.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_exit_codes() {
        let conflict = CliError::Mirror(MirrorError::ConcurrencyConflict {
            table_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
        });
        assert_eq!(conflict.exit_code(), 5);
        assert!(conflict.suggestion().is_some());

        let offline = CliError::Mirror(MirrorError::Connectivity {
            message: "connection refused".to_string(),
        });
        assert_eq!(offline.exit_code(), 3);

        assert_eq!(CliError::Validation("bad".to_string()).exit_code(), 4);
        assert_eq!(CliError::Config("missing".to_string()).exit_code(), 1);
    }

    #[test]
    fn test_source_configuration_error_is_config() {
        let err: CliError = SourceError::InvalidConfiguration {
            message: "ERP_BASE_URL environment variable is required".to_string(),
        }
        .into();
        assert!(matches!(err, CliError::Config(_)));
    }
}
