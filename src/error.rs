//! # Error Taxonomy
//!
//! Every failure zxscript reports falls into one of a handful of buckets:
//! something the user asked for does not exist, a settings file is broken,
//! an external tool (the build or the package search) failed, or the user
//! interrupted the run. Each bucket maps to a distinct process exit status
//! so callers (shell scripts, CI jobs) can tell them apart.

use std::path::PathBuf;
use thiserror::Error;

/// Exit status reported when the user interrupts a build or run (128 + SIGINT).
pub const EXIT_CANCELLED: i32 = 130;

#[derive(Debug, Error)]
pub enum ZxError {
    /// A script, project, source file or settings directory is missing.
    #[error("{what} not found: {}", path.display())]
    NotFound { what: &'static str, path: PathBuf },

    /// A settings file exists but is not valid settings JSON.
    #[error("malformed settings file {}: {source}", path.display())]
    MalformedSettings {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// An external tool exited unsuccessfully. `code` is its own exit code.
    #[error("{tool} failed with exit code {code}")]
    ToolFailed { tool: String, code: i32 },

    #[error("could not resolve a version for package '{name}': {reason}")]
    PackageResolution { name: String, reason: String },

    #[error("cancelled")]
    Cancelled,
}

impl ZxError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ZxError::Io { path: path.into(), source }
    }

    /// The process exit status this error should surface as.
    pub fn exit_code(&self) -> i32 {
        match self {
            ZxError::NotFound { .. } => 2,
            ZxError::MalformedSettings { .. } => 3,
            ZxError::Io { .. } => 1,
            ZxError::ToolFailed { code, .. } => *code,
            ZxError::PackageResolution { .. } => 1,
            ZxError::Cancelled => EXIT_CANCELLED,
        }
    }
}

/// Picks the exit status for an arbitrary error bubbling out of a command.
///
/// Errors that are not a [`ZxError`] anywhere in their chain exit with 1.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ZxError>())
        .map(ZxError::exit_code)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_tool_failure_keeps_the_tool_exit_code() {
        let err = ZxError::ToolFailed { tool: "dotnet build".into(), code: 42 };
        assert_eq!(err.exit_code(), 42);
    }

    #[test]
    fn test_exit_code_found_through_context_layers() {
        let result: anyhow::Result<()> = Err(ZxError::Cancelled).context("while running script");
        let err = result.unwrap_err();
        assert_eq!(exit_code_for(&err), EXIT_CANCELLED);

        let plain = anyhow::anyhow!("something else");
        assert_eq!(exit_code_for(&plain), 1);
    }

    #[test]
    fn test_not_found_and_malformed_are_distinct() {
        let missing = ZxError::NotFound { what: "script", path: PathBuf::from("a.cs") };
        let parse_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let malformed = ZxError::MalformedSettings { path: PathBuf::from("x.json"), source: parse_err };
        assert_ne!(missing.exit_code(), malformed.exit_code());
        assert!(malformed.to_string().contains("x.json"));
    }
}
