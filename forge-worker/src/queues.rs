//! Queue kinds served by the worker

use clap::ValueEnum;
use forge_core::domain::TaskKind;
use std::fmt;

/// One of the four queues a worker can consume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum QueueKind {
    Job,
    Model,
    Drawing,
    Unity,
}

impl QueueKind {
    pub const ALL: [QueueKind; 4] = [
        QueueKind::Job,
        QueueKind::Model,
        QueueKind::Drawing,
        QueueKind::Unity,
    ];

    /// Label used in logs and task profiles
    pub fn label(&self) -> &'static str {
        match self {
            QueueKind::Job => "JOBQ",
            QueueKind::Model => "MODELQ",
            QueueKind::Drawing => "DRAWINGQ",
            QueueKind::Unity => "UNITYQ",
        }
    }

    /// Whether a task of `kind` may be executed from this queue
    pub fn accepts(&self, kind: &TaskKind) -> bool {
        match self {
            QueueKind::Job => matches!(
                kind,
                TaskKind::ImportToy { .. }
                    | TaskKind::GenerateFederation { .. }
                    | TaskKind::GenerateStash { .. }
            ),
            QueueKind::Model => matches!(kind, TaskKind::Import { .. }),
            QueueKind::Drawing => matches!(kind, TaskKind::ProcessDrawing { .. }),
            QueueKind::Unity => matches!(kind, TaskKind::GenerateAssetBundle { .. }),
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueKind::Job => "job",
            QueueKind::Model => "model",
            QueueKind::Drawing => "drawing",
            QueueKind::Unity => "unity",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::domain::SkipStages;

    #[test]
    fn test_queue_accepts_its_kinds() {
        let toy = TaskKind::ImportToy {
            toy_model_id: "toy42".to_string(),
            skip_stages: SkipStages::new(),
        };
        let import = TaskKind::Import {
            param_file: "/tmp/params.json".to_string(),
        };

        assert!(QueueKind::Job.accepts(&toy));
        assert!(!QueueKind::Model.accepts(&toy));
        assert!(QueueKind::Model.accepts(&import));
        assert!(!QueueKind::Job.accepts(&import));
        assert!(!QueueKind::Unity.accepts(&import));
    }

    #[test]
    fn test_parse_from_cli_value() {
        assert_eq!(QueueKind::from_str("drawing", true), Ok(QueueKind::Drawing));
        assert!(QueueKind::from_str("bogus", true).is_err());
        assert_eq!(QueueKind::Unity.to_string(), "unity");
    }
}
