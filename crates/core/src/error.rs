//! Error types for permctl
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

/// Main error type for permctl
#[derive(Error, Debug)]
pub enum PermctlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The queried package, permission or group no longer exists.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The platform does not support the requested app-op on this release.
    #[error("Unsupported app-op: {0}")]
    UnsupportedOp(String),

    /// Any other failure reported by a platform service.
    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Main context closed")]
    ContextClosed,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Cancelled")]
    Cancelled,
}

/// Result type alias for permctl operations
pub type Result<T> = std::result::Result<T, PermctlError>;

impl PermctlError {
    /// Check if this error is recoverable
    ///
    /// Recoverable errors only drop one input from a derived computation;
    /// the computation itself carries on.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PermctlError::UnsupportedOp(_)
                | PermctlError::Platform(_)
                | PermctlError::Cancelled
        )
    }

    /// Whether the queried entity is gone for good
    pub fn is_not_found(&self) -> bool {
        matches!(self, PermctlError::NotFound(_))
    }

    /// Shorthand for a not-found package
    pub fn package_not_found(package: &str) -> Self {
        PermctlError::NotFound(format!("package {}", package))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(PermctlError::package_not_found("com.example").is_not_found());
        assert!(!PermctlError::package_not_found("com.example").is_recoverable());
        assert!(PermctlError::UnsupportedOp("android:foo".into()).is_recoverable());
        assert!(!PermctlError::ContextClosed.is_recoverable());
        assert_eq!(
            PermctlError::package_not_found("com.example").to_string(),
            "Not found: package com.example"
        );
    }
}
