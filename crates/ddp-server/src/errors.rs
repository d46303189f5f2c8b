//! Server error types.

use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the settings file from disk.
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the settings file.
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A settings value was invalid (e.g., out of range).
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

/// Registration conflicts, raised while the server is being assembled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// A method with this name already exists.
    #[error("'{0}' is already a method. Overriding is not supported!")]
    DuplicateMethod(String),
    /// A publication with this name already exists.
    #[error("'{0}' is already a publication. Overriding is not supported!")]
    DuplicatePublication(String),
}

/// Errors from starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// A handler registration was rejected.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Binding the listener or serving failed.
    #[error("server I/O error: {0}")]
    Io(#[from] std::io::Error),
}
