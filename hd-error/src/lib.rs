//! Unified error handling for hd-idle
//!
//! This crate provides the single error type shared by every hd-idle module.
//! It uses thiserror for Display and Error trait impls.

use std::io;
use std::path::PathBuf;

/// Result type alias using HdIdleError
pub type Result<T> = std::result::Result<T, HdIdleError>;

/// Unified error type for all hd-idle operations
#[derive(thiserror::Error, Debug)]
pub enum HdIdleError {
    // ============================================================================
    // File System Errors
    // ============================================================================
    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    // ============================================================================
    // Audit Log Errors
    // ============================================================================
    #[error("Cannot open file {path}. Error: {source}")]
    LogOpen {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Cannot write into file {path}. Error: {source}")]
    LogWrite {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Cannot close file {path}. Error: {source}")]
    LogClose {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Cannot write to console: {0}")]
    Console(io::Error),

    // ============================================================================
    // Disk Access Errors
    // ============================================================================
    #[error("Failed to parse disk statistics from {path}: {reason}")]
    DiskStats {
        path: PathBuf,
        reason: String,
    },

    #[error("Cannot resolve symlink {name}: {reason}")]
    Resolve {
        name: String,
        reason: String,
    },

    #[error("cannot spindown {protocol} disk {device}: {reason}")]
    Spindown {
        device: String,
        protocol: String,
        reason: String,
    },

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    #[error("{0}")]
    Usage(String),
}

impl HdIdleError {
    /// Create an invalid configuration error for a named field
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a command line usage error
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::Usage(msg.into())
    }

    /// True for failures of the audit log sink, which must stop the daemon
    pub fn is_log_sink(&self) -> bool {
        matches!(
            self,
            Self::LogOpen { .. } | Self::LogWrite { .. } | Self::LogClose { .. } | Self::Console(_)
        )
    }

    /// Short advice for the operator when this error stops the daemon
    pub fn operator_hint(&self) -> Option<&'static str> {
        if !self.is_log_sink() {
            return None;
        }
        match self {
            Self::Console(_) => Some("standard output is gone; keep it attached when running hd-idle"),
            _ => Some("check that the -l log file's directory exists and is writable by hd-idle"),
        }
    }
}
