//! Asset-bundle build
//!
//! Runs the Unity editor in batch mode through the configured launcher. The
//! editor writes its log into the task log directory, which is where licence
//! failures are detected afterwards. Each build starts from an empty log, so
//! a redelivered task is judged on its own attempt only.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::UnityConfig;
use tracing::{debug, warn};

use crate::process::{ProcessError, ProcessRun, ProcessRunner};

const LABEL: &str = "UNITY";

pub struct AssetBundleService {
    runner: Arc<dyn ProcessRunner>,
    config: UnityConfig,
}

impl AssetBundleService {
    pub fn new(runner: Arc<dyn ProcessRunner>, config: UnityConfig) -> Self {
        Self { runner, config }
    }

    /// Editor log of a task
    pub fn log_path(&self, log_dir: &Path) -> PathBuf {
        log_dir.join(&self.config.log_file)
    }

    /// Builds the asset bundles of `database`/`model`
    pub async fn generate(
        &self,
        database: &str,
        model: &str,
        log_dir: &Path,
    ) -> Result<i32, ProcessError> {
        let arguments = vec![
            self.config.project.display().to_string(),
            database.to_string(),
            model.to_string(),
            log_dir.display().to_string(),
        ];

        let run = ProcessRun::new(
            &self.config.bat_path,
            arguments,
            Duration::from_millis(self.config.timeout_ms),
            LABEL,
        )
        .with_output_log(self.log_path(log_dir));

        self.discard_previous_log(log_dir).await;
        self.runner.run(run).await
    }

    /// Removes the log left behind by an earlier attempt of the same task
    async fn discard_previous_log(&self, log_dir: &Path) {
        let path = self.log_path(log_dir);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!("Removed previous build log {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove build log {}: {}", path.display(), e),
        }
    }
}
