//! Task descriptors
//!
//! A descriptor is decoded once per inbound message and never mutated
//! afterwards. Its kind decides which pipeline runs it and which converter
//! arguments are built.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Post-processing stages a caller asked to skip
///
/// Decoded from a JSON object such as `{"tree":1}`; every key whose value is
/// truthy is skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipStages(BTreeSet<String>);

impl SkipStages {
    /// Stage that regenerates the tree stash after a toy import
    pub const TREE: &'static str = "tree";

    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the set from a decoded JSON object
    ///
    /// Returns `None` when the value is not an object.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let object = value.as_object()?;
        let stages = object
            .iter()
            .filter(|(_, flag)| is_truthy(flag))
            .map(|(stage, _)| stage.clone())
            .collect();
        Some(Self(stages))
    }

    pub fn contains(&self, stage: &str) -> bool {
        self.0.contains(stage)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => true,
    }
}

/// What a message asks the worker to do, with the fields specific to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    /// Import a model file through the converter
    Import { param_file: String },

    /// Build a federation; optionally import a toy model into it afterwards
    GenerateFederation {
        param_file: String,
        toy_federation: Option<String>,
    },

    /// Load a prepared toy model with the bulk loader
    ImportToy {
        toy_model_id: String,
        skip_stages: SkipStages,
    },

    /// Regenerate a stash for an existing model
    GenerateStash { stash_type: String, revision: String },

    /// Import a drawing revision, converting it to vector form first if needed
    ProcessDrawing {
        param_file: String,
        revision_id: String,
        drawing_format: String,
        file: String,
        file_size: Option<u64>,
    },

    /// Build asset bundles for a model the converter already imported
    GenerateAssetBundle { param_file: String, upstream_code: i32 },
}

impl TaskKind {
    /// Command token that selects this kind
    pub fn command(&self) -> &'static str {
        match self {
            TaskKind::Import { .. } => "import",
            TaskKind::GenerateFederation { .. } => "genFed",
            TaskKind::ImportToy { .. } => "importToy",
            TaskKind::GenerateStash { .. } => "genStash",
            TaskKind::ProcessDrawing { .. } => "processDrawing",
            TaskKind::GenerateAssetBundle { .. } => "genAssetBundles",
        }
    }

    /// Whether this kind is executed by invoking the converter directly
    pub fn runs_converter(&self) -> bool {
        !matches!(
            self,
            TaskKind::ImportToy { .. } | TaskKind::GenerateAssetBundle { .. }
        )
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command())
    }
}

/// Decoded, typed representation of one queue message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDescriptor {
    /// Correlation identifier of the delivery this task came from
    pub correlation_id: String,

    /// Target database (teamspace)
    pub database: String,

    /// Target model
    pub model: String,

    /// User who requested the task, when the command says so
    pub owner: Option<String>,

    /// Command tokens after shared-directory substitution
    pub command: Vec<String>,

    pub kind: TaskKind,
}

impl TaskDescriptor {
    /// Builds the converter argument list for this task
    ///
    /// The converter always takes its configuration file first, followed by the
    /// original command tokens. Kinds that never invoke the converter return
    /// `None`.
    pub fn converter_args(&self, config_path: &str) -> Option<Vec<String>> {
        if !self.kind.runs_converter() {
            return None;
        }

        let mut args = Vec::with_capacity(self.command.len() + 1);
        args.push(config_path.to_string());
        args.extend(self.command.iter().cloned());
        Some(args)
    }

    /// Command forwarded to the asset-bundle queue after a successful import
    pub fn handoff_command(&self, upstream_code: i32) -> Option<String> {
        match &self.kind {
            TaskKind::Import { param_file } => {
                Some(format!("genAssetBundles {} {}", param_file, upstream_code))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(kind: TaskKind, command: &[&str]) -> TaskDescriptor {
        TaskDescriptor {
            correlation_id: "rid".to_string(),
            database: "teamspace1".to_string(),
            model: "model1".to_string(),
            owner: None,
            command: command.iter().map(|s| s.to_string()).collect(),
            kind,
        }
    }

    #[test]
    fn test_skip_stages_from_json() {
        let value = serde_json::json!({"tree": 1, "history": 0, "issues": true, "risks": null});
        let skip = SkipStages::from_json(&value).unwrap();
        assert!(skip.contains(SkipStages::TREE));
        assert!(skip.contains("issues"));
        assert!(!skip.contains("history"));
        assert!(!skip.contains("risks"));

        assert!(SkipStages::from_json(&serde_json::json!([1, 2])).is_none());
        assert!(SkipStages::from_json(&serde_json::json!({})).unwrap().is_empty());
    }

    #[test]
    fn test_converter_args_lead_with_config() {
        let task = descriptor(
            TaskKind::GenerateStash {
                stash_type: "tree".to_string(),
                revision: "all".to_string(),
            },
            &["genStash", "teamspace1", "model1", "tree", "all"],
        );

        let args = task.converter_args("/etc/forge/converter.json").unwrap();
        assert_eq!(args[0], "/etc/forge/converter.json");
        assert_eq!(&args[1..], &["genStash", "teamspace1", "model1", "tree", "all"]);
    }

    #[test]
    fn test_toy_import_has_no_converter_args() {
        let task = descriptor(
            TaskKind::ImportToy {
                toy_model_id: "toy42".to_string(),
                skip_stages: SkipStages::new(),
            },
            &["importToy", "teamspace1", "model1", "toy42"],
        );
        assert!(task.converter_args("cfg").is_none());
        assert!(task.handoff_command(0).is_none());
    }

    #[test]
    fn test_handoff_command() {
        let task = descriptor(
            TaskKind::Import {
                param_file: "/shared/rid/params.json".to_string(),
            },
            &["import", "-f", "/shared/rid/params.json"],
        );
        assert_eq!(
            task.handoff_command(7).unwrap(),
            "genAssetBundles /shared/rid/params.json 7"
        );
    }
}
