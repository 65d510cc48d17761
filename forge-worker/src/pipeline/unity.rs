//! Unity queue
//!
//! Consumes the model queue's hand-off, builds the asset bundles and folds the
//! upstream converter code with the build outcome into one terminal reply.
//! The build log decides whether a failure was a licence problem.

use forge_broker::Replier;
use forge_core::codes;
use forge_core::domain::{TaskDescriptor, TaskKind};
use tracing::{error, info};

use super::{PipelineContext, StageResult, send_result};
use crate::process::ProcessError;

pub(super) async fn execute(
    ctx: &PipelineContext,
    task: &TaskDescriptor,
    replier: &dyn Replier,
) -> StageResult {
    let TaskKind::GenerateAssetBundle { upstream_code, .. } = &task.kind else {
        return send_result(replier, task, codes::ARG_FILE_FAIL).await;
    };
    let Some(bundles) = &ctx.bundles else {
        error!("Asset bundle generation is not configured on this worker");
        return send_result(replier, task, codes::BUNDLE_GEN_FAIL).await;
    };

    let log_dir = ctx.log_dir(&task.correlation_id).await;
    info!(
        "Generating asset bundles for {}.{}",
        task.database, task.model
    );
    let outcome = bundles
        .generate(&task.database, &task.model, &log_dir)
        .await;

    if ctx
        .classifier
        .file_has_licence_error(&bundles.log_path(&log_dir))
    {
        return Err(ctx.licence_invalid(task).await);
    }

    let code = fold_codes(*upstream_code, outcome);
    send_result(replier, task, code).await
}

/// One code for the import and the bundle build
fn fold_codes(upstream_code: i32, bundle_outcome: Result<i32, ProcessError>) -> i32 {
    match bundle_outcome {
        Ok(_) => upstream_code,
        Err(ProcessError::Timeout { .. }) => codes::TIMEOUT,
        Err(e) => {
            error!("Asset bundle generation failed: {}", e);
            codes::BUNDLE_GEN_FAIL
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::queues::QueueKind;
    use forge_broker::MessageHandler;
    use std::time::Duration;

    fn handoff(harness: &Harness, upstream: i32) -> String {
        let params = harness.params(
            "import.json",
            serde_json::json!({ "database": "teamspace1", "project": "model1" }),
        );
        format!("genAssetBundles {} {}", params, upstream)
    }

    async fn deliver(harness: &Harness, body: &str) -> Result<(), forge_broker::Requeue> {
        harness
            .handler(QueueKind::Unity)
            .on_message(body.to_string(), "cid-9".to_string(), harness.replier())
            .await
    }

    #[test]
    fn test_fold_codes() {
        assert_eq!(fold_codes(codes::OK, Ok(0)), codes::OK);
        assert_eq!(fold_codes(7, Ok(0)), 7);
        assert_eq!(
            fold_codes(
                codes::OK,
                Err(ProcessError::Exited {
                    label: "UNITY".to_string(),
                    code: 1
                })
            ),
            codes::BUNDLE_GEN_FAIL
        );
        assert_eq!(
            fold_codes(
                7,
                Err(ProcessError::Timeout {
                    label: "UNITY".to_string(),
                    timeout: Duration::from_secs(1)
                })
            ),
            codes::TIMEOUT
        );
    }

    #[tokio::test]
    async fn test_bundles_built_with_upstream_code() {
        let harness = Harness::new();
        let body = handoff(&harness, 10);

        deliver(&harness, &body).await.unwrap();

        let runs = harness.runs();
        assert_eq!(runs[0].label, "UNITY");
        assert_eq!(runs[0].arguments[..3], ["/opt/unity", "teamspace1", "model1"]);
        assert!(runs[0].output_log.as_ref().unwrap().ends_with("cid-9/unity.log"));
        assert_eq!(harness.terminal_values(), vec![10]);
    }

    #[tokio::test]
    async fn test_licence_error_in_build_log_requeues() {
        let harness = Harness::new();
        let body = handoff(&harness, 0);
        harness.runner.push_with_output(
            "UNITY",
            Err(ProcessError::Exited {
                label: "UNITY".to_string(),
                code: 1,
            }),
            "No valid Unity Editor license found",
        );

        let outcome = deliver(&harness, &body).await;

        assert!(outcome.is_err());
        assert!(harness.terminal_values().is_empty());
    }

    #[tokio::test]
    async fn test_redelivery_after_licence_fix_completes() {
        let harness = Harness::new();
        let body = handoff(&harness, 7);
        harness.runner.push_with_output(
            "UNITY",
            Err(ProcessError::Exited {
                label: "UNITY".to_string(),
                code: 1,
            }),
            "No valid Unity Editor license found",
        );
        harness
            .runner
            .push_with_output("UNITY", Ok(0), "Build succeeded");

        // Same correlation id, so both attempts share a log directory
        assert!(deliver(&harness, &body).await.is_err());
        deliver(&harness, &body).await.unwrap();

        assert_eq!(harness.runs().len(), 2);
        assert_eq!(harness.terminal_values(), vec![7]);

        let log = std::fs::read_to_string(harness.logs_root().join("cid-9/unity.log")).unwrap();
        assert!(!log.contains("license"));
    }

    #[tokio::test]
    async fn test_build_failure_is_reported() {
        let harness = Harness::new();
        let body = handoff(&harness, 0);
        harness.runner.push(
            "UNITY",
            Err(ProcessError::Exited {
                label: "UNITY".to_string(),
                code: 1,
            }),
        );

        deliver(&harness, &body).await.unwrap();

        assert_eq!(harness.terminal_values(), vec![codes::BUNDLE_GEN_FAIL]);
    }
}
