//! Forge Worker
//!
//! A durable task-queue worker. Commands arrive on AMQP queues, are decoded
//! into typed tasks and executed as short pipelines of supervised external
//! processes; every task ends with a code-classified reply.
//!
//! Architecture:
//! - Configuration: JSON file given with `--config`
//! - Process: spawning, timeouts and exit-code classification
//! - Monitor: peak memory and elapsed time per in-flight task
//! - Services: converter, toy import, asset bundles, PDF conversion
//! - Pipeline: one executor per queue kind
//!
//! Without `--exitAfter` the worker serves until the broker connection is
//! lost for good. With it, the worker handles that many messages and exits.

mod config;
mod monitor;
mod pipeline;
mod process;
mod queues;
mod service;

use anyhow::{Context, Result, bail};
use clap::Parser;
use forge_broker::{
    AmqpConnector, BoundedRun, BrokerError, ConnectionSupervisor, QueueDispatcher, ReconnectPolicy,
};
use forge_core::{Decoder, DecoderSettings};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::WorkerConfig;
use crate::monitor::{ElasticSink, LogSink, ReportSink, ResourceMonitor};
use crate::pipeline::{PipelineContext, QueueHandler};
use crate::process::{ProcessRunner, ProcessSupervisor};
use crate::queues::QueueKind;
use crate::service::{
    AssetBundleService, ConverterService, MongoToyImporter, SubstringClassifier, SvgService,
};

/// Application id on replies to messages that carry none
const APP_ID: &str = "forge-worker";

/// Upper bound for the delay between reconnect attempts
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(name = "forge-worker")]
#[command(about = "Durable task-queue worker", long_about = None)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, env = "FORGE_WORKER_CONFIG")]
    config: PathBuf,

    /// Serve a single queue (default: every configured queue)
    #[arg(long, value_enum)]
    queue: Option<QueueKind>,

    /// Handle this many messages, then exit
    #[arg(long = "exitAfter", requires = "queue")]
    exit_after: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "forge_worker=info,forge_broker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    info!("Starting Forge Worker");

    let config = WorkerConfig::load(&cli.config)?;
    let queues = selected_queues(&config, cli.queue)?;
    for queue in &queues {
        config
            .validate(*queue)
            .with_context(|| format!("Invalid configuration for the {} queue", queue))?;
    }
    info!(
        "Loaded configuration: host={}, queues={:?}",
        config.rabbitmq.host, queues
    );

    let runner: Arc<dyn ProcessRunner> = Arc::new(ProcessSupervisor::new());
    let context = Arc::new(build_context(&config, runner)?);

    context
        .converter
        .self_test()
        .await
        .context("Converter self-test failed")?;

    let connector = AmqpConnector::new(config.rabbitmq.host.clone());
    let policy = ReconnectPolicy {
        max_retries: config.rabbitmq.max_retries,
        initial_delay: Duration::from_millis(config.rabbitmq.reconnect_delay_ms),
        max_delay: MAX_RECONNECT_DELAY,
    };
    let supervisor = ConnectionSupervisor::new(connector, policy);

    match (cli.exit_after, queues.as_slice()) {
        (Some(tasks), [queue]) => run_tasks(supervisor, &config, context, *queue, tasks).await,
        (Some(_), _) => bail!("--exitAfter needs exactly one --queue"),
        (None, _) => serve(supervisor, &config, context, queues).await,
    }
}

/// Queues to serve: the one asked for, or every configured one
fn selected_queues(config: &WorkerConfig, requested: Option<QueueKind>) -> Result<Vec<QueueKind>> {
    if let Some(queue) = requested {
        return Ok(vec![queue]);
    }

    let queues: Vec<QueueKind> = QueueKind::ALL
        .into_iter()
        .filter(|queue| config.rabbitmq.queue_name(*queue).is_some())
        .collect();

    if queues.is_empty() {
        bail!("No queue configured in the rabbitmq section");
    }
    Ok(queues)
}

/// Wires the pipeline collaborators from the configuration
fn build_context(config: &WorkerConfig, runner: Arc<dyn ProcessRunner>) -> Result<PipelineContext> {
    let converter = ConverterService::new(
        Arc::clone(&runner),
        config.converter.clone(),
        config.repo_license.clone(),
        config.instance_id.clone(),
    );
    let toy = MongoToyImporter::new(Arc::clone(&runner), config.toy.clone());
    let bundles = config
        .unity
        .clone()
        .map(|unity| Arc::new(AssetBundleService::new(Arc::clone(&runner), unity)));
    let svg = config
        .drawing
        .clone()
        .map(|drawing| Arc::new(SvgService::new(Arc::clone(&runner), drawing)));

    let monitor = if config.monitor.enabled {
        let sink: Arc<dyn ReportSink> = match &config.elastic {
            Some(elastic) => {
                info!("Sending task reports to {}", elastic.url);
                Arc::new(ElasticSink::new(elastic)?)
            }
            None => Arc::new(LogSink),
        };
        ResourceMonitor::new(monitor::probe::detect(), sink, config.monitor.interval())
    } else {
        ResourceMonitor::disabled()
    };

    Ok(PipelineContext {
        decoder: Decoder::new(DecoderSettings {
            shared_dir: config.rabbitmq.shared_dir.clone(),
        }),
        converter: Arc::new(converter),
        toy: Arc::new(toy),
        bundles,
        svg,
        classifier: Arc::new(SubstringClassifier::default()),
        monitor,
        task_log_dir: config.logging.task_log_dir.clone(),
        unity_queue: config.rabbitmq.unity_queue.clone(),
        licence_cooldown: config.rabbitmq.licence_cooldown(),
    })
}

/// Consumes `queues` until the reconnect budget is spent
async fn serve(
    mut supervisor: ConnectionSupervisor<AmqpConnector>,
    config: &WorkerConfig,
    context: Arc<PipelineContext>,
    queues: Vec<QueueKind>,
) -> Result<()> {
    let rabbit = &config.rabbitmq;

    let result = supervisor
        .run(|connection, close| {
            let context = Arc::clone(&context);
            let queues = queues.clone();
            async move {
                let dispatcher =
                    QueueDispatcher::open(&connection, rabbit.callback_queue.clone(), APP_ID)
                        .await?;

                for queue in queues {
                    let name = rabbit.queue_name(queue).ok_or_else(|| {
                        BrokerError::Setup(format!("no queue configured for {}", queue))
                    })?;
                    let handler = Arc::new(QueueHandler::new(queue, Arc::clone(&context)));
                    dispatcher
                        .listen(name, rabbit.prefetch(queue), handler, close.clone())
                        .await?;
                }

                Ok::<(), BrokerError>(())
            }
        })
        .await;

    if let Err(e) = result {
        error!(
            "Broker connection lost after {} session(s): {}",
            supervisor.state().connections(),
            e
        );
        return Err(e.into());
    }
    Ok(())
}

/// Handles up to `tasks` messages from `queue` on a single connection
async fn run_tasks(
    supervisor: ConnectionSupervisor<AmqpConnector>,
    config: &WorkerConfig,
    context: Arc<PipelineContext>,
    queue: QueueKind,
    tasks: u32,
) -> Result<()> {
    let rabbit = &config.rabbitmq;
    let name = rabbit
        .queue_name(queue)
        .with_context(|| format!("No queue configured for {}", queue))?;

    let connection = supervisor
        .connect_once()
        .await
        .context("Failed to connect to broker")?;
    let dispatcher = QueueDispatcher::open(&connection, rabbit.callback_queue.clone(), APP_ID)
        .await
        .context("Failed to open channel")?;

    let run = BoundedRun {
        tasks,
        max_wait: Duration::from_millis(rabbit.max_wait_time_ms),
        polling_interval: Duration::from_millis(rabbit.polling_interval_ms),
        drain_pause: Duration::from_millis(rabbit.wait_before_shutdown_ms),
    };
    let handler = Arc::new(QueueHandler::new(queue, context));

    let handled = dispatcher.execute_tasks(name, run, handler).await?;
    info!("Handled {} task(s) from {}, exiting", handled, name);

    connection
        .close(200, "OK")
        .await
        .context("Failed to close broker connection")?;
    Ok(())
}
