//! Reply payloads
//!
//! JSON bodies published to the reply queue. Intermediate replies carry a
//! `status`; terminal replies carry a `value` (a return code).

use serde::{Deserialize, Serialize};

/// Intermediate status of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    #[serde(rename = "processing")]
    Processing,

    /// The import finished and bundle generation was queued downstream
    #[serde(rename = "Generating Bundles")]
    GeneratingBundles,
}

/// Reply published to the reply queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Reply {
    /// Intermediate status reply
    pub fn status(status: TaskStatus, database: &str, project: &str) -> Self {
        Self {
            status: Some(status),
            database: Some(database.to_string()),
            project: Some(project.to_string()),
            ..Default::default()
        }
    }

    /// Terminal reply carrying a return code
    pub fn result(value: i32, database: &str, project: &str, user: Option<&str>) -> Self {
        Self {
            value: Some(value),
            database: Some(database.to_string()),
            project: Some(project.to_string()),
            user: user.map(str::to_string),
            ..Default::default()
        }
    }

    /// Terminal reply for a message that never decoded
    pub fn rejected(value: i32) -> Self {
        Self {
            value: Some(value),
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn to_json(&self) -> String {
        // Every field is a plain string or integer, so this cannot fail
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
