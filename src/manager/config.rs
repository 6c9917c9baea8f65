//! Commit worker configuration.

use std::time::Duration;

use crate::error::{CommitError, CommitResult};

/// Configuration for the [`UpdateManager`](super::UpdateManager).
#[derive(Debug, Clone)]
pub struct CommitConfig {
    /// Wait between commit cycles when nothing asks for a flush.
    pub commit_interval: Duration,
    /// Storage attempts per update, delete or site delete before the work is
    /// dropped and logged. `None` retries until the storage accepts it.
    pub max_commit_attempts: Option<u32>,
    /// Extra cycles run on shutdown to flush what is still pending.
    pub shutdown_flush_attempts: u32,
    /// Name of the worker thread.
    pub thread_name: String,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            commit_interval: Duration::from_secs(1),
            max_commit_attempts: Some(10),
            shutdown_flush_attempts: 3,
            thread_name: "kyrocommit-worker".to_string(),
        }
    }
}

impl CommitConfig {
    /// # Errors
    /// `Config` for a zero interval, a zero attempt bound or an empty thread
    /// name.
    pub fn validate(self) -> CommitResult<Self> {
        if self.commit_interval.is_zero() {
            return Err(CommitError::Config {
                reason: "commit_interval must be non-zero".to_string(),
            });
        }
        if self.max_commit_attempts == Some(0) {
            return Err(CommitError::Config {
                reason: "max_commit_attempts must be at least 1 (or None for unbounded)".to_string(),
            });
        }
        if self.thread_name.trim().is_empty() {
            return Err(CommitError::Config {
                reason: "thread_name must not be empty".to_string(),
            });
        }
        Ok(self)
    }

    /// Whether work that failed `attempts` times may be tried again.
    #[must_use]
    pub fn allows_retry(&self, attempts: u32) -> bool {
        self.max_commit_attempts.map_or(true, |max| attempts < max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(CommitConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_degenerate_values() {
        let cfg = CommitConfig {
            commit_interval: Duration::ZERO,
            ..CommitConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(CommitError::Config { .. })));

        let cfg = CommitConfig {
            max_commit_attempts: Some(0),
            ..CommitConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_retry_bound() {
        let bounded = CommitConfig {
            max_commit_attempts: Some(2),
            ..CommitConfig::default()
        };
        assert!(bounded.allows_retry(1));
        assert!(!bounded.allows_retry(2));

        let unbounded = CommitConfig {
            max_commit_attempts: None,
            ..CommitConfig::default()
        };
        assert!(unbounded.allows_retry(u32::MAX));
    }
}
