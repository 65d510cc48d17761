//! Model queue
//!
//! Imports a model through the converter. When the import produced output and
//! a unity queue is configured, bundle generation is handed off as a new
//! message on that queue instead of running here, so it can be retried on
//! its own.

use forge_broker::Replier;
use forge_core::codes;
use forge_core::domain::{TaskDescriptor, TaskStatus};
use tracing::{error, info};

use super::{PipelineContext, StageResult, send_result, send_status};
use crate::queues::QueueKind;

pub(super) async fn execute(
    ctx: &PipelineContext,
    task: &TaskDescriptor,
    replier: &dyn Replier,
) -> StageResult {
    send_status(replier, task, TaskStatus::Processing).await?;

    let log_dir = ctx.log_dir(&task.correlation_id).await;
    let profile = ctx.profile(task, QueueKind::Model);

    let code = match ctx
        .run_monitored_converter(task, profile, Vec::new(), &log_dir)
        .await
    {
        Ok(code) => code,
        Err(e) if e.code() == codes::LICENCE_INVALID => {
            return Err(ctx.licence_invalid(task).await);
        }
        Err(e) => {
            error!("Import model error: {}", e);
            ctx.monitor.send_report(&task.correlation_id).await;
            return send_result(replier, task, e.code()).await;
        }
    };
    ctx.monitor.send_report(&task.correlation_id).await;

    let handoff = ctx
        .unity_queue
        .as_deref()
        .zip(task.handoff_command(code));

    match handoff {
        Some((queue, command)) => {
            info!("Handing {} over to {}", task.correlation_id, queue);
            replier.send(command, Some(queue)).await?;
            send_status(replier, task, TaskStatus::GeneratingBundles).await
        }
        None => send_result(replier, task, code).await,
    }
}
