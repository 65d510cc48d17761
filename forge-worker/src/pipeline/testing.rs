//! Fakes for pipeline tests: a scripted process runner, a recording replier
//! and a toy importer that never touches a database.

use async_trait::async_trait;
use forge_broker::{BrokerError, Replier};
use forge_core::{Decoder, DecoderSettings};
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{PipelineContext, QueueHandler};
use crate::config::{ConverterConfig, DrawingConfig, UnityConfig};
use crate::monitor::{MemoryProbe, ReportSink, ResourceMonitor, TaskReport};
use crate::process::{ProcessError, ProcessRun, ProcessRunner};
use crate::queues::QueueKind;
use crate::service::{
    AssetBundleService, ConverterService, SubstringClassifier, SvgService, ToyImportError,
    ToyImporter,
};

type ScriptedResult = (Result<i32, ProcessError>, Option<String>);

/// Runner answering from a per-label script, `Ok(0)` once a script runs out
#[derive(Default)]
pub struct ScriptedRunner {
    runs: Mutex<Vec<ProcessRun>>,
    script: Mutex<HashMap<String, VecDeque<ScriptedResult>>>,
}

impl ScriptedRunner {
    pub fn push(&self, label: &str, result: Result<i32, ProcessError>) {
        self.enqueue(label, (result, None));
    }

    /// Like [`push`](Self::push), also appending `output` to the run's output log
    pub fn push_with_output(&self, label: &str, result: Result<i32, ProcessError>, output: &str) {
        self.enqueue(label, (result, Some(output.to_string())));
    }

    fn enqueue(&self, label: &str, entry: ScriptedResult) {
        self.script
            .lock()
            .unwrap()
            .entry(label.to_string())
            .or_default()
            .push_back(entry);
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(&self, run: ProcessRun) -> Result<i32, ProcessError> {
        let label = run.label.clone();
        let output_log = run.output_log.clone();
        self.runs.lock().unwrap().push(run);

        let (result, output) = self
            .script
            .lock()
            .unwrap()
            .get_mut(&label)
            .and_then(VecDeque::pop_front)
            .unwrap_or((Ok(0), None));

        if let (Some(output), Some(path)) = (output, output_log) {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .unwrap();
            writeln!(file, "{}", output).unwrap();
        }
        result
    }
}

/// Replier keeping every payload and its target queue
#[derive(Default)]
pub struct RecordingReplier {
    sent: Mutex<Vec<(String, Option<String>)>>,
    failing: AtomicBool,
}

impl RecordingReplier {
    pub fn fail_sends(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Replier for RecordingReplier {
    async fn send(&self, payload: String, queue: Option<&str>) -> forge_broker::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(BrokerError::Setup("channel closed".to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((payload, queue.map(str::to_string)));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeToyImporter {
    pub calls: Mutex<Vec<(String, String, String)>>,
    failing: AtomicBool,
}

impl FakeToyImporter {
    pub fn fail_imports(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ToyImporter for FakeToyImporter {
    async fn import(
        &self,
        toy_model_id: &str,
        database: &str,
        model: &str,
    ) -> Result<(), ToyImportError> {
        self.calls.lock().unwrap().push((
            toy_model_id.to_string(),
            database.to_string(),
            model.to_string(),
        ));
        if self.failing.load(Ordering::SeqCst) {
            return Err(ToyImportError::Empty(PathBuf::from(toy_model_id)));
        }
        Ok(())
    }
}

/// Probe reporting a constant usage
pub struct FixedProbe(pub u64);

impl MemoryProbe for FixedProbe {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn read(&self) -> std::io::Result<u64> {
        Ok(self.0)
    }
}

/// Sink keeping every report it receives
#[derive(Default)]
pub struct RecordingSink {
    reports: Mutex<Vec<TaskReport>>,
}

impl RecordingSink {
    pub fn reports(&self) -> Vec<TaskReport> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReportSink for RecordingSink {
    async fn push(&self, report: &TaskReport) -> anyhow::Result<()> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}

pub struct Harness {
    pub runner: Arc<ScriptedRunner>,
    pub replier: Arc<RecordingReplier>,
    pub toy: Arc<FakeToyImporter>,
    pub dir: tempfile::TempDir,
    pub unity_queue: Option<String>,
    pub monitor: ResourceMonitor,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            runner: Arc::new(ScriptedRunner::default()),
            replier: Arc::new(RecordingReplier::default()),
            toy: Arc::new(FakeToyImporter::default()),
            dir: tempfile::tempdir().unwrap(),
            unity_queue: None,
            monitor: ResourceMonitor::disabled(),
        }
    }

    /// Enables the resource monitor and returns the sink its reports go to
    pub fn record_reports(&mut self) -> Arc<RecordingSink> {
        let sink = Arc::new(RecordingSink::default());
        self.monitor = ResourceMonitor::new(
            Arc::new(FixedProbe(4096)),
            sink.clone(),
            Duration::from_millis(10),
        );
        sink
    }

    pub fn logs_root(&self) -> PathBuf {
        self.dir.path().join("logs")
    }

    pub fn context(&self) -> Arc<PipelineContext> {
        let converter = ConverterService::new(
            self.runner.clone(),
            ConverterConfig {
                path: PathBuf::from("/opt/converter"),
                config_path: "/etc/converter.json".to_string(),
                timeout_ms: 1000,
                envars: HashMap::new(),
                soft_fails: vec![7, 10, 15],
            },
            None,
            None,
        );
        let bundles = AssetBundleService::new(
            self.runner.clone(),
            UnityConfig {
                bat_path: PathBuf::from("unity.sh"),
                project: PathBuf::from("/opt/unity"),
                timeout_ms: 1000,
                log_file: "unity.log".to_string(),
            },
        );
        let svg = SvgService::new(
            self.runner.clone(),
            DrawingConfig {
                svg_tool: PathBuf::from("pdf2svg"),
                timeout_ms: 1000,
            },
        );

        Arc::new(PipelineContext {
            decoder: Decoder::new(DecoderSettings::default()),
            converter: Arc::new(converter),
            toy: self.toy.clone(),
            bundles: Some(Arc::new(bundles)),
            svg: Some(Arc::new(svg)),
            classifier: Arc::new(SubstringClassifier::default()),
            monitor: self.monitor.clone(),
            task_log_dir: self.logs_root(),
            unity_queue: self.unity_queue.clone(),
            licence_cooldown: Duration::from_millis(10),
        })
    }

    pub fn handler(&self, queue: QueueKind) -> QueueHandler {
        QueueHandler::new(queue, self.context())
    }

    pub fn replier(&self) -> Arc<dyn Replier> {
        self.replier.clone()
    }

    /// Writes a parameter file and returns its path
    pub fn params(&self, name: &str, value: serde_json::Value) -> String {
        let path = self.dir.path().join(name);
        std::fs::write(&path, value.to_string()).unwrap();
        path.display().to_string()
    }

    /// Every payload with its target queue
    pub fn sent(&self) -> Vec<(String, Option<String>)> {
        self.replier.sent.lock().unwrap().clone()
    }

    /// Replies to the default reply queue, parsed
    pub fn replies(&self) -> Vec<serde_json::Value> {
        self.sent()
            .into_iter()
            .filter(|(_, queue)| queue.is_none())
            .map(|(payload, _)| serde_json::from_str(&payload).unwrap())
            .collect()
    }

    pub fn terminal_values(&self) -> Vec<i32> {
        self.replies()
            .iter()
            .filter_map(|reply| reply.get("value").and_then(|value| value.as_i64()))
            .map(|value| value as i32)
            .collect()
    }

    pub fn runs(&self) -> Vec<ProcessRun> {
        self.runner.runs.lock().unwrap().clone()
    }
}
