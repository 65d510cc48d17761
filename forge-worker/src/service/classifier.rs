//! Build log classification
//!
//! The editor's exit code does not tell a licence failure from a build
//! failure on every platform, so its log is scanned instead.

use std::path::Path;

/// Decides whether a build log shows a licence failure
pub trait LogClassifier: Send + Sync {
    fn is_licence_error(&self, log: &str) -> bool;

    /// Scans a log file; an unreadable file is not a licence error
    fn file_has_licence_error(&self, path: &Path) -> bool {
        std::fs::read_to_string(path)
            .map(|log| self.is_licence_error(&log))
            .unwrap_or(false)
    }
}

/// Matches known licence error messages
#[derive(Debug, Clone)]
pub struct SubstringClassifier {
    patterns: Vec<String>,
}

impl SubstringClassifier {
    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }
}

impl Default for SubstringClassifier {
    fn default() -> Self {
        Self::new(
            [
                "No valid Unity Editor license found",
                "Unity has not been activated",
                "License is not active",
                "LICENSE SYSTEM [ERROR]",
                "Failed to activate/update license",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        )
    }
}

impl LogClassifier for SubstringClassifier {
    fn is_licence_error(&self, log: &str) -> bool {
        self.patterns.iter().any(|pattern| log.contains(pattern))
    }
}
