/*
 * pacsmith - Package resolution and build orchestration for Arch Linux.
 * Copyright (C) 2025  pacsmith contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Hierarchical error types with context and recovery strategies.

use std::fmt;
use thiserror::Error;

/// Main error type for pacsmith operations
#[derive(Debug, Error)]
pub enum PacsmithError {
    /// A package source could not answer; callers degrade to the others
    #[error("Source '{source_name}' unavailable: {reason}")]
    SourceUnavailable { source_name: String, reason: String },

    /// Resolution failed; no plan is produced
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    /// The human reviewer rejected a build script
    #[error("Build script for '{package}' was rejected")]
    ReviewRejected { package: String },

    /// Execution refused while review decisions are outstanding
    #[error("Plan has unreviewed items: {}", .pending.join(", "))]
    PlanNotReviewed { pending: Vec<String> },

    /// An external tool exited unsuccessfully
    #[error("'{package}' failed: subprocess exited with {}", describe_exit(.exit_code))]
    SubprocessFailure {
        package: String,
        exit_code: Option<i32>,
        captured_output: Vec<String>,
    },

    /// User-initiated cancellation
    #[error("Operation cancelled")]
    Cancelled,

    /// Another process holds the package database lock
    #[error("Package database is locked ({path})")]
    DatabaseLocked { path: String },

    /// Network errors during API calls or snapshot downloads
    #[error("Network error for {url}: {message}")]
    Network {
        url: String,
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// File system errors
    #[error("File system error for '{path}': {message}")]
    FileSystem {
        path: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Generic/wrapped error
    #[error("{0}")]
    Other(String),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "a signal".to_string(),
    }
}

/// A requirement on a package, tagged with who asked for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredConstraint {
    pub required_by: String,
    pub constraint: String,
}

impl fmt::Display for RequiredConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (required by {})", self.constraint, self.required_by)
    }
}

/// Typed failure of a resolve request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    /// A package was reached again while its own dependencies were being walked
    #[error("Circular dependency detected: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// Requirers demand version ranges that cannot all hold
    #[error("Version conflict for '{name}': {}", join_constraints(.constraints))]
    VersionConflict {
        name: String,
        constraints: Vec<RequiredConstraint>,
    },

    /// Neither source knows the package or a provider for it
    #[error("Package '{name}' not found (required by {})", .required_by.as_deref().unwrap_or("target"))]
    NotFound {
        name: String,
        required_by: Option<String>,
    },

    /// Two packages in the plan exclude each other
    #[error("Package conflict: '{package}' conflicts with '{conflicts_with}'")]
    PackageConflict {
        package: String,
        conflicts_with: String,
    },

    /// Several packages provide the same name and the policy refuses to pick
    #[error("Ambiguous provider for '{name}': {}", .candidates.join(", "))]
    AmbiguousProvider { name: String, candidates: Vec<String> },
}

fn join_constraints(constraints: &[RequiredConstraint]) -> String {
    constraints
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Recovery strategy for errors
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryStrategy {
    /// Retry the operation with a delay
    Retry { max_attempts: u32, initial_delay_ms: u64 },
    /// Continue with a degraded alternative
    Fallback { alternative: String },
    /// Abort and cleanup
    Abort,
    /// Prompt user for decision
    UserPrompt { message: String, options: Vec<String> },
    /// No recovery possible
    Fatal,
}

impl PacsmithError {
    /// Get the recommended recovery strategy for this error
    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            PacsmithError::SourceUnavailable { .. } => RecoveryStrategy::Fallback {
                alternative: "continue with the remaining sources".to_string(),
            },
            PacsmithError::Network { .. } => RecoveryStrategy::Retry {
                max_attempts: 3,
                initial_delay_ms: 1000,
            },
            PacsmithError::DatabaseLocked { .. } => RecoveryStrategy::Retry {
                max_attempts: 5,
                initial_delay_ms: 2000,
            },
            PacsmithError::SubprocessFailure { .. } => RecoveryStrategy::UserPrompt {
                message: "Transaction item failed".to_string(),
                options: vec!["Retry".to_string(), "Skip".to_string(), "Abort".to_string()],
            },
            PacsmithError::Resolution(_) => RecoveryStrategy::Fatal,
            PacsmithError::Config { .. } => RecoveryStrategy::Fatal,
            _ => RecoveryStrategy::Abort,
        }
    }

    /// Whether the caller can carry on after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.recovery_strategy(),
            RecoveryStrategy::Retry { .. } | RecoveryStrategy::Fallback { .. }
        )
    }

    /// Create a source-unavailable error
    pub fn unavailable(source_name: impl Into<String>, reason: impl fmt::Display) -> Self {
        PacsmithError::SourceUnavailable {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a network error
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        PacsmithError::Network {
            url: url.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a filesystem error
    pub fn filesystem(path: impl AsRef<std::path::Path>, message: impl Into<String>, source: std::io::Error) -> Self {
        PacsmithError::FileSystem {
            path: path.as_ref().display().to_string(),
            message: message.into(),
            source: Some(source),
        }
    }
}

/// Result type alias for pacsmith operations
pub type PacsmithResult<T> = std::result::Result<T, PacsmithError>;

/// Extension trait for adding context to errors
pub trait ErrorContext<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> PacsmithResult<T>;
}

impl<T, E: std::error::Error + Send + Sync + 'static> ErrorContext<T> for Result<T, E> {
    fn context(self, context: impl Into<String>) -> PacsmithResult<T> {
        self.map_err(|e| PacsmithError::Other(format!("{}: {}", context.into(), e)))
    }
}
