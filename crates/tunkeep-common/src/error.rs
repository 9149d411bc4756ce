//! Error types for tunnel keeper operations.
//!
//! Every fallible operation in the tunkeep crates returns [`KeeperResult`].
//! Only [`KeeperError::ModuleLoad`] is fatal to the daemon; everything else
//! is logged by the reconciliation loop and retried on the next cycle.

use std::io;
use thiserror::Error;

/// Result type alias for tunnel keeper operations.
pub type KeeperResult<T> = Result<T, KeeperError>;

/// Errors that can occur while keeping the tunnel alive.
#[derive(Debug, Error)]
pub enum KeeperError {
    /// Failed to execute a shell command (spawn error).
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// Configuration file could not be read or parsed.
    #[error("Failed to load configuration from {path}: {message}")]
    ConfigLoad {
        /// Path of the configuration file.
        path: String,
        /// Error message.
        message: String,
    },

    /// A required kernel module could not be loaded.
    #[error("Failed to load kernel module '{module}': {message}")]
    ModuleLoad {
        /// The module name.
        module: String,
        /// Error message.
        message: String,
    },

    /// Output of a system query could not be understood.
    #[error("Failed to parse {what}: {message}")]
    Parse {
        /// What was being parsed (e.g., "link state").
        what: String,
        /// Error message.
        message: String,
    },

    /// Control-plane HTTP request failed.
    #[error("HTTP request failed: {message}")]
    Http {
        /// Error message.
        message: String,
    },
}

impl KeeperError {
    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a configuration load error.
    pub fn config_load(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigLoad {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a kernel module load error.
    pub fn module_load(module: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ModuleLoad {
            module: module.into(),
            message: message.into(),
        }
    }

    /// Creates a parse error.
    pub fn parse(what: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            what: what.into(),
            message: message.into(),
        }
    }

    /// Creates an HTTP error.
    pub fn http(message: impl Into<String>) -> Self {
        Self::Http {
            message: message.into(),
        }
    }

    /// Returns true if this error must terminate the daemon.
    ///
    /// A missing kernel module cannot be fixed by retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, KeeperError::ModuleLoad { .. })
    }
}
