//! Error types for the friend network pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Pipeline-level failures.
///
/// Per-friend fetch problems (throttling, not found, flaky network) are not
/// errors: they are recorded on the friend's `MutualResult` and the run goes on.
/// User cancellation is not an error either; see `RunOutcome::Cancelled`.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Login required: no authenticated session is available")]
    AuthenticationRequired,

    #[error("Friend list is empty")]
    EmptyFriendList,

    #[error("A network generation run is already in progress")]
    AlreadyRunning,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Config file error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl NetworkError {
    /// Whether the error ends the current run
    pub fn is_fatal(&self) -> bool {
        !matches!(self, NetworkError::AlreadyRunning)
    }

    /// Single actionable line for the caller's status display
    pub fn user_message(&self) -> String {
        match self {
            NetworkError::AuthenticationRequired => {
                "Login required: import a session cookie and generate again".to_string()
            }
            NetworkError::EmptyFriendList => {
                "No friends found: check the friend list source".to_string()
            }
            NetworkError::AlreadyRunning => "Generation already running".to_string(),
            NetworkError::Storage(_) | NetworkError::Io(_) => {
                format!("Could not write local data: {}", self)
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_messages() {
        assert!(
            NetworkError::AuthenticationRequired
                .user_message()
                .starts_with("Login required")
        );
        assert!(NetworkError::EmptyFriendList.is_fatal());
        assert!(!NetworkError::AlreadyRunning.is_fatal());

        let io = NetworkError::from(std::io::Error::other("disk full"));
        assert!(io.user_message().contains("disk full"));
    }
}
