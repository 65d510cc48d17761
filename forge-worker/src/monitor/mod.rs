//! Resource monitor
//!
//! Tracks peak memory and elapsed time per in-flight task. Records are keyed
//! by task identity (the correlation id), not by process id, because one task
//! may run several processes in sequence.
//!
//! Lifecycle of a record:
//! 1. [`ResourceMonitor::start`] takes a baseline reading and starts a sampler
//! 2. The sampler keeps the running maximum on a fixed interval
//! 3. [`ResourceMonitor::stop`] stops the sampler and finalizes the report
//! 4. [`ResourceMonitor::send_report`] or [`ResourceMonitor::clear_report`]
//!    waits one interval, deletes the record, then pushes or discards it
//!
//! Monitoring is best-effort: failures are logged and never reach the caller.

pub mod probe;
pub mod sink;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use probe::MemoryProbe;
pub use sink::{ElasticSink, LogSink, ReportSink};

/// What a task is, as recorded alongside its measurements
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskProfile {
    pub owner: Option<String>,
    pub model: String,
    pub database: String,
    pub queue: String,
    /// Whether the run used a licence key
    pub licensee: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

/// Finalized measurements of one task
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TaskReport {
    #[serde(flatten)]
    pub profile: TaskProfile,

    /// Peak memory above the baseline, in bytes
    pub max_memory: u64,

    /// Elapsed wall time in milliseconds
    pub process_time: u64,

    pub return_code: i32,

    pub date_time: DateTime<Utc>,

    #[serde(skip)]
    pub start_memory: u64,

    #[serde(skip)]
    pub peak_memory: u64,
}

struct Record {
    profile: TaskProfile,
    start_memory: u64,
    peak_memory: Arc<AtomicU64>,
    started: Instant,
    sampler: JoinHandle<()>,
    report: Option<TaskReport>,
}

/// Live table of monitored tasks
#[derive(Clone)]
pub struct ResourceMonitor {
    inner: Option<Arc<MonitorInner>>,
}

struct MonitorInner {
    probe: Arc<dyn MemoryProbe>,
    sink: Arc<dyn ReportSink>,
    interval: Duration,
    records: Mutex<HashMap<String, Record>>,
}

impl ResourceMonitor {
    /// Creates a monitor
    ///
    /// # Arguments
    /// * `probe` - Memory reading strategy, resolved once at startup
    /// * `sink` - Destination of sent reports
    /// * `interval` - Sampling interval, also the grace delay before deletion
    pub fn new(probe: Arc<dyn MemoryProbe>, sink: Arc<dyn ReportSink>, interval: Duration) -> Self {
        Self {
            inner: Some(Arc::new(MonitorInner {
                probe,
                sink,
                interval,
                records: Mutex::new(HashMap::new()),
            })),
        }
    }

    /// A monitor that records nothing
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Starts monitoring task `id`
    pub fn start(&self, id: &str, profile: TaskProfile) {
        let Some(inner) = &self.inner else {
            return;
        };

        let start_memory = match inner.probe.read() {
            Ok(memory) => memory,
            Err(e) => {
                warn!("Not monitoring {}: failed to read memory: {}", id, e);
                return;
            }
        };

        let peak_memory = Arc::new(AtomicU64::new(start_memory));
        let sampler = spawn_sampler(
            Arc::clone(&inner.probe),
            Arc::clone(&peak_memory),
            inner.interval,
        );

        let record = Record {
            profile,
            start_memory,
            peak_memory,
            started: Instant::now(),
            sampler,
            report: None,
        };

        let mut records = inner.records.lock().unwrap();
        if let Some(previous) = records.insert(id.to_string(), record) {
            warn!("Replacing monitor record for {}", id);
            previous.sampler.abort();
        }
        debug!("Monitoring {} (baseline {} bytes)", id, start_memory);
    }

    /// Stops sampling task `id` and finalizes its report
    ///
    /// Returns `None`, doing nothing, when `id` is not monitored or was
    /// already stopped.
    pub fn stop(&self, id: &str, return_code: i32) -> Option<TaskReport> {
        let inner = self.inner.as_ref()?;
        let mut records = inner.records.lock().unwrap();

        let Some(record) = records.get_mut(id) else {
            debug!("No monitor record for {}", id);
            return None;
        };
        if record.report.is_some() {
            debug!("Monitor for {} already stopped", id);
            return None;
        }

        record.sampler.abort();

        let peak_memory = record
            .peak_memory
            .load(Ordering::SeqCst)
            .max(record.start_memory);
        let report = TaskReport {
            profile: record.profile.clone(),
            max_memory: peak_memory - record.start_memory,
            process_time: record.started.elapsed().as_millis() as u64,
            return_code,
            date_time: Utc::now(),
            start_memory: record.start_memory,
            peak_memory,
        };

        record.report = Some(report.clone());
        Some(report)
    }

    /// Deletes the record for `id` and pushes its report to the sink
    pub async fn send_report(&self, id: &str) {
        let Some(report) = self.take_report(id).await else {
            return;
        };

        let Some(inner) = &self.inner else {
            return;
        };
        if let Err(e) = inner.sink.push(&report).await {
            warn!("Failed to send report for {}: {:#}", id, e);
        }
    }

    /// Deletes the record for `id` without reporting it
    pub async fn clear_report(&self, id: &str) {
        if let Some(report) = self.take_report(id).await {
            info!(
                "Discarding report for {} (max memory {} bytes, {} ms, code {})",
                id, report.max_memory, report.process_time, report.return_code
            );
        }
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.inner
            .as_ref()
            .map(|inner| inner.records.lock().unwrap().len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn take_report(&self, id: &str) -> Option<TaskReport> {
        let inner = self.inner.as_ref()?;

        // A sample may still be in flight
        tokio::time::sleep(inner.interval).await;

        let record = inner.records.lock().unwrap().remove(id)?;
        record.sampler.abort();

        if record.report.is_none() {
            warn!("Monitor for {} was never stopped, dropping it", id);
        }
        record.report
    }
}

fn spawn_sampler(
    probe: Arc<dyn MemoryProbe>,
    peak_memory: Arc<AtomicU64>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);

        loop {
            ticker.tick().await;
            match probe.read() {
                Ok(memory) => {
                    peak_memory.fetch_max(memory, Ordering::SeqCst);
                }
                Err(e) => debug!("Memory sample failed: {}", e),
            }
        }
    })
}
