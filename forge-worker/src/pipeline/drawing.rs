//! Drawing queue
//!
//! PDF drawings are converted to SVG first; the SVG path becomes an extra
//! trailing converter argument.

use forge_broker::Replier;
use forge_core::codes;
use forge_core::domain::{TaskDescriptor, TaskKind, TaskStatus};
use std::time::Duration;
use tracing::error;

use super::{PipelineContext, StageResult, converter_args, send_result, send_status};
use crate::queues::QueueKind;

/// Keeps the status update from overtaking the upstream enqueue confirmation
const STATUS_DELAY: Duration = Duration::from_millis(100);

pub(super) async fn execute(
    ctx: &PipelineContext,
    task: &TaskDescriptor,
    replier: &dyn Replier,
) -> StageResult {
    let TaskKind::ProcessDrawing {
        revision_id,
        drawing_format,
        file,
        file_size,
        ..
    } = &task.kind
    else {
        return send_result(replier, task, codes::ARG_FILE_FAIL).await;
    };

    tokio::time::sleep(STATUS_DELAY).await;
    send_status(replier, task, TaskStatus::Processing).await?;

    let svg = if is_pdf(drawing_format) {
        let Some(svg) = &ctx.svg else {
            error!("PDF conversion is not configured on this worker");
            return send_result(replier, task, codes::CONVERTER_CRASH).await;
        };
        Some(svg)
    } else {
        None
    };

    let log_dir = ctx.log_dir(&task.correlation_id).await;
    let mut arguments = converter_args(&ctx.converter, task);

    let mut profile = ctx.profile(task, QueueKind::Drawing);
    profile.revision = Some(revision_id.clone());
    profile.file_format = Some(drawing_format.clone());
    profile.file_size = *file_size;

    // One record covers the conversion and the import
    ctx.monitor.start(&task.correlation_id, profile);

    if let Some(svg) = svg {
        let svg_path = log_dir.join(format!("{}.svg", task.correlation_id));
        if let Err(e) = svg.generate(file, &svg_path).await {
            error!("Drawing conversion error: {}", e);
            ctx.monitor.stop(&task.correlation_id, e.code());
            ctx.monitor.send_report(&task.correlation_id).await;
            return send_result(replier, task, e.code()).await;
        }
        arguments.push(svg_path.display().to_string());
    }

    let result = ctx.converter.run(arguments, &log_dir).await;
    let code = match &result {
        Ok(code) => *code,
        Err(e) => e.code(),
    };
    ctx.monitor.stop(&task.correlation_id, code);

    match result {
        Err(e) if e.code() == codes::LICENCE_INVALID => {
            return Err(ctx.licence_invalid(task).await);
        }
        Err(e) => error!("Import drawing error: {}", e),
        Ok(_) => {}
    }

    ctx.monitor.send_report(&task.correlation_id).await;
    send_result(replier, task, code).await
}

fn is_pdf(format: &str) -> bool {
    format.trim_start_matches('.').eq_ignore_ascii_case("pdf")
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::process::ProcessError;
    use forge_broker::MessageHandler;

    fn drawing_message(harness: &Harness, format: &str) -> String {
        let params = harness.params(
            "drawing.json",
            serde_json::json!({
                "database": "teamspace1",
                "project": "drawing1",
                "owner": "carol",
                "revId": "rev-3",
                "file": "/data/rev-3.pdf",
                "format": format,
                "size": 2048
            }),
        );
        format!("processDrawing {}", params)
    }

    async fn deliver(harness: &Harness, body: &str) -> Result<(), forge_broker::Requeue> {
        harness
            .handler(QueueKind::Drawing)
            .on_message(body.to_string(), "cid-3".to_string(), harness.replier())
            .await
    }

    #[test]
    fn test_pdf_detection() {
        assert!(is_pdf(".pdf"));
        assert!(is_pdf("pdf"));
        assert!(is_pdf(".PDF"));
        assert!(!is_pdf(".dwg"));
    }

    #[tokio::test]
    async fn test_pdf_is_converted_before_import() {
        let harness = Harness::new();
        let body = drawing_message(&harness, ".PDF");

        deliver(&harness, &body).await.unwrap();

        let runs = harness.runs();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].label, "SVG");
        assert_eq!(runs[0].arguments[0], "/data/rev-3.pdf");

        let svg_path = runs[0].arguments[1].clone();
        assert!(svg_path.ends_with("cid-3.svg"));
        assert_eq!(runs[1].label, "CONVERTER");
        assert_eq!(runs[1].arguments.last(), Some(&svg_path));

        let replies = harness.replies();
        assert_eq!(replies[0]["status"], "processing");
        assert_eq!(harness.terminal_values(), vec![codes::OK]);
    }

    #[tokio::test]
    async fn test_other_formats_go_straight_to_converter() {
        let harness = Harness::new();
        let body = drawing_message(&harness, ".dwg");

        deliver(&harness, &body).await.unwrap();

        let runs = harness.runs();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].arguments[1], "processDrawing");
    }

    #[tokio::test]
    async fn test_conversion_failure_skips_import() {
        let harness = Harness::new();
        harness.runner.push(
            "SVG",
            Err(ProcessError::Exited {
                label: "SVG".to_string(),
                code: 3,
            }),
        );
        let body = drawing_message(&harness, ".pdf");

        deliver(&harness, &body).await.unwrap();

        assert_eq!(harness.runs().len(), 1);
        assert_eq!(harness.terminal_values(), vec![3]);
    }

    #[tokio::test]
    async fn test_conversion_is_monitored() {
        let mut harness = Harness::new();
        let reports = harness.record_reports();
        harness.runner.push(
            "SVG",
            Err(ProcessError::Exited {
                label: "SVG".to_string(),
                code: 3,
            }),
        );
        let body = drawing_message(&harness, ".pdf");

        deliver(&harness, &body).await.unwrap();

        let reports = reports.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].return_code, 3);
        assert_eq!(reports[0].profile.queue, "DRAWINGQ");
        assert_eq!(reports[0].profile.revision.as_deref(), Some("rev-3"));
    }

    #[tokio::test]
    async fn test_conversion_and_import_share_one_report() {
        let mut harness = Harness::new();
        let reports = harness.record_reports();
        let body = drawing_message(&harness, ".pdf");

        deliver(&harness, &body).await.unwrap();

        assert_eq!(harness.runs().len(), 2);
        let reports = reports.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].return_code, codes::OK);
        assert_eq!(reports[0].profile.file_size, Some(2048));
    }
}
