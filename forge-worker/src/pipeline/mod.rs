//! Pipeline executors
//!
//! One executor per queue kind. Each is a short fixed sequence of async
//! stages over a decoded [`TaskDescriptor`]:
//! decode → (status reply) → stage 1 → stage 2 → … → terminal reply
//!
//! Outcomes map onto delivery settlement:
//! - malformed or misrouted message → single error reply, ack
//! - process failure → failure reply carrying the code, ack
//! - invalid licence → cooldown, then requeue
//! - reply publish failure → requeue

mod drawing;
mod job;
mod model;
mod unity;

#[cfg(test)]
mod testing;

use async_trait::async_trait;
use forge_broker::{BrokerError, MessageHandler, Replier, Requeue};
use forge_core::codes;
use forge_core::domain::{Reply, TaskDescriptor, TaskStatus};
use forge_core::Decoder;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::monitor::{ResourceMonitor, TaskProfile};
use crate::process::ProcessError;
use crate::queues::QueueKind;
use crate::service::{AssetBundleService, ConverterService, LogClassifier, SvgService, ToyImporter};

/// Failures that put the delivery back on the queue
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid licence")]
    LicenceInvalid,

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl From<PipelineError> for Requeue {
    fn from(err: PipelineError) -> Self {
        Requeue::new(err.to_string())
    }
}

type StageResult<T = ()> = Result<T, PipelineError>;

/// Collaborators shared by every pipeline
pub struct PipelineContext {
    pub decoder: Decoder,
    pub converter: Arc<ConverterService>,
    pub toy: Arc<dyn ToyImporter>,
    /// Present when this worker serves the unity queue
    pub bundles: Option<Arc<AssetBundleService>>,
    /// Present when this worker serves the drawing queue
    pub svg: Option<Arc<SvgService>>,
    pub classifier: Arc<dyn LogClassifier>,
    pub monitor: ResourceMonitor,
    /// Root of the per-task log directories
    pub task_log_dir: PathBuf,
    /// Destination of hand-off messages from the model queue
    pub unity_queue: Option<String>,
    /// How long an invalid-licence delivery is held before requeueing
    pub licence_cooldown: Duration,
}

impl PipelineContext {
    /// Log directory of a task, created on demand
    async fn log_dir(&self, correlation_id: &str) -> PathBuf {
        let dir = self.task_log_dir.join(correlation_id);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!("Failed to create log directory {}: {}", dir.display(), e);
        }
        dir
    }

    /// Holds the delivery for the cooldown window, then asks for a requeue
    async fn licence_invalid(&self, task: &TaskDescriptor) -> PipelineError {
        error!(
            "Invalid licence while processing {}, requeueing in {:?}",
            task.correlation_id, self.licence_cooldown
        );
        self.monitor.clear_report(&task.correlation_id).await;
        tokio::time::sleep(self.licence_cooldown).await;
        PipelineError::LicenceInvalid
    }

    /// Runs the converter for `task` under the resource monitor
    ///
    /// `extra` is appended to the task's own converter arguments.
    async fn run_monitored_converter(
        &self,
        task: &TaskDescriptor,
        profile: TaskProfile,
        extra: Vec<String>,
        log_dir: &Path,
    ) -> Result<i32, ProcessError> {
        let mut arguments = converter_args(&self.converter, task);
        arguments.extend(extra);

        self.monitor.start(&task.correlation_id, profile);
        let result = self.converter.run(arguments, log_dir).await;
        let code = match &result {
            Ok(code) => *code,
            Err(e) => e.code(),
        };
        self.monitor.stop(&task.correlation_id, code);
        result
    }

    fn profile(&self, task: &TaskDescriptor, queue: QueueKind) -> TaskProfile {
        TaskProfile {
            owner: task.owner.clone(),
            model: task.model.clone(),
            database: task.database.clone(),
            queue: queue.label().to_string(),
            licensee: self.converter.licensed(),
            ..Default::default()
        }
    }
}

/// Converter arguments of `task`, configuration file first
fn converter_args(converter: &ConverterService, task: &TaskDescriptor) -> Vec<String> {
    task.converter_args(converter.config_path())
        .unwrap_or_else(|| vec![converter.config_path().to_string()])
}

async fn send(replier: &dyn Replier, reply: &Reply) -> StageResult {
    replier.send(reply.to_json(), None).await?;
    Ok(())
}

async fn send_status(replier: &dyn Replier, task: &TaskDescriptor, status: TaskStatus) -> StageResult {
    send(replier, &Reply::status(status, &task.database, &task.model)).await
}

async fn send_result(replier: &dyn Replier, task: &TaskDescriptor, value: i32) -> StageResult {
    let reply = Reply::result(value, &task.database, &task.model, task.owner.as_deref());
    info!(
        "Task {} finished with code {} ({})",
        task.correlation_id,
        value,
        codes::describe(value)
    );
    send(replier, &reply).await
}

/// Message handler for one queue kind
pub struct QueueHandler {
    queue: QueueKind,
    context: Arc<PipelineContext>,
}

impl QueueHandler {
    pub fn new(queue: QueueKind, context: Arc<PipelineContext>) -> Self {
        Self { queue, context }
    }

    async fn dispatch(&self, task: &TaskDescriptor, replier: &dyn Replier) -> StageResult {
        match self.queue {
            QueueKind::Job => job::execute(&self.context, task, replier).await,
            QueueKind::Model => model::execute(&self.context, task, replier).await,
            QueueKind::Drawing => drawing::execute(&self.context, task, replier).await,
            QueueKind::Unity => unity::execute(&self.context, task, replier).await,
        }
    }
}

#[async_trait]
impl MessageHandler for QueueHandler {
    async fn on_message(
        &self,
        body: String,
        correlation_id: String,
        replier: Arc<dyn Replier>,
    ) -> Result<(), Requeue> {
        let label = self.queue.label();
        info!("[{}] Received {} ({})", label, body, correlation_id);

        let task = match self.context.decoder.decode(&body, &correlation_id) {
            Ok(task) if self.queue.accepts(&task.kind) => task,
            Ok(task) => {
                error!("[{}] {} tasks are not handled on this queue", label, task.kind);
                let reply = Reply::rejected(codes::ARG_FILE_FAIL)
                    .with_message(format!("{} is not accepted by the {} queue", task.kind, self.queue));
                send(replier.as_ref(), &reply).await?;
                return Ok(());
            }
            Err(e) => {
                error!("[{}] Failed to decode {}: {}", label, correlation_id, e);
                let reply = Reply::rejected(e.code()).with_message(e.reason);
                send(replier.as_ref(), &reply).await?;
                return Ok(());
            }
        };

        self.dispatch(&task, replier.as_ref()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_malformed_message_is_acked_with_single_error() {
        let harness = Harness::new();
        let handler = harness.handler(QueueKind::Job);

        let outcome = handler
            .on_message("explode now".to_string(), "cid-1".to_string(), harness.replier())
            .await;

        assert!(outcome.is_ok());
        let replies = harness.replies();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["value"], codes::ARG_FILE_FAIL);
        assert!(harness.runs().is_empty());
    }

    #[tokio::test]
    async fn test_misrouted_message_is_rejected() {
        let harness = Harness::new();
        let handler = harness.handler(QueueKind::Drawing);

        let outcome = handler
            .on_message(
                "genStash teamspace1 model1".to_string(),
                "cid-1".to_string(),
                harness.replier(),
            )
            .await;

        assert!(outcome.is_ok());
        assert_eq!(harness.terminal_values(), vec![codes::ARG_FILE_FAIL]);
        assert!(harness.runs().is_empty());
    }

    #[tokio::test]
    async fn test_reply_failure_requeues() {
        let harness = Harness::new();
        harness.replier.fail_sends();
        let handler = harness.handler(QueueKind::Job);

        let outcome = handler
            .on_message(
                "genStash teamspace1 model1".to_string(),
                "cid-1".to_string(),
                harness.replier(),
            )
            .await;

        assert!(outcome.is_err());
    }
}
