//! Job queue
//!
//! - `importToy`: toy import, then a tree stash unless the caller skipped it
//! - `genFed`: converter, then a toy import when the federation is a toy
//! - `genStash`: converter
//!
//! Federations get no "processing" reply.

use forge_broker::Replier;
use forge_core::codes;
use forge_core::domain::{Reply, SkipStages, TaskDescriptor, TaskKind, TaskStatus};
use tracing::{error, info};

use super::{PipelineContext, StageResult, converter_args, send, send_result, send_status};

pub(super) async fn execute(
    ctx: &PipelineContext,
    task: &TaskDescriptor,
    replier: &dyn Replier,
) -> StageResult {
    match &task.kind {
        TaskKind::ImportToy {
            toy_model_id,
            skip_stages,
        } => import_toy(ctx, task, toy_model_id, skip_stages, replier).await,
        TaskKind::GenerateFederation { toy_federation, .. } => {
            generate_federation(ctx, task, toy_federation.as_deref(), replier).await
        }
        TaskKind::GenerateStash { .. } => {
            send_status(replier, task, TaskStatus::Processing).await?;
            let log_dir = ctx.log_dir(&task.correlation_id).await;

            let code = match ctx
                .converter
                .run(converter_args(&ctx.converter, task), &log_dir)
                .await
            {
                Ok(code) => code,
                Err(e) if e.code() == codes::LICENCE_INVALID => {
                    return Err(ctx.licence_invalid(task).await);
                }
                Err(e) => {
                    error!("Generate stash error: {}", e);
                    e.code()
                }
            };
            send_result(replier, task, code).await
        }
        _ => send_result(replier, task, codes::ARG_FILE_FAIL).await,
    }
}

async fn import_toy(
    ctx: &PipelineContext,
    task: &TaskDescriptor,
    toy_model_id: &str,
    skip_stages: &SkipStages,
    replier: &dyn Replier,
) -> StageResult {
    send_status(replier, task, TaskStatus::Processing).await?;

    if let Err(e) = ctx.toy.import(toy_model_id, &task.database, &task.model).await {
        error!("importToy module error: {}", e);
        return fail(replier, task, e.code(), e.to_string()).await;
    }

    if skip_stages.contains(SkipStages::TREE) {
        return send_result(replier, task, codes::OK).await;
    }

    info!("Toy model imported. Generating tree...");
    let log_dir = ctx.log_dir(&task.correlation_id).await;
    match ctx
        .converter
        .generate_stash(&log_dir, &task.database, &task.model, "tree", "all")
        .await
    {
        Ok(_) => send_result(replier, task, codes::OK).await,
        Err(e) if e.code() == codes::LICENCE_INVALID => Err(ctx.licence_invalid(task).await),
        Err(e) => {
            error!("Tree generation for toy model failed: {}", e);
            fail(replier, task, codes::TOY_IMPORT_FAILED, e.to_string()).await
        }
    }
}

async fn generate_federation(
    ctx: &PipelineContext,
    task: &TaskDescriptor,
    toy_federation: Option<&str>,
    replier: &dyn Replier,
) -> StageResult {
    let log_dir = ctx.log_dir(&task.correlation_id).await;

    let code = match ctx
        .converter
        .run(converter_args(&ctx.converter, task), &log_dir)
        .await
    {
        Ok(code) => code,
        Err(e) if e.code() == codes::LICENCE_INVALID => {
            return Err(ctx.licence_invalid(task).await);
        }
        Err(e) => {
            error!("Generate federation error: {}", e);
            return fail(replier, task, e.code(), e.to_string()).await;
        }
    };

    if let Some(toy) = toy_federation {
        info!("Federation generated. Importing toy federation {}...", toy);
        if let Err(e) = ctx.toy.import(toy, &task.database, &task.model).await {
            error!("Toy federation import error: {}", e);
            return fail(replier, task, e.code(), e.to_string()).await;
        }
    }

    send_result(replier, task, code).await
}

async fn fail(
    replier: &dyn Replier,
    task: &TaskDescriptor,
    value: i32,
    message: String,
) -> StageResult {
    let reply = Reply::result(value, &task.database, &task.model, task.owner.as_deref())
        .with_message(message);
    send(replier, &reply).await
}
