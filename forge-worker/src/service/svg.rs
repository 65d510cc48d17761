//! PDF to SVG conversion for drawings

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::config::DrawingConfig;
use crate::process::{ProcessError, ProcessRun, ProcessRunner};

const LABEL: &str = "SVG";

pub struct SvgService {
    runner: Arc<dyn ProcessRunner>,
    config: DrawingConfig,
}

impl SvgService {
    pub fn new(runner: Arc<dyn ProcessRunner>, config: DrawingConfig) -> Self {
        Self { runner, config }
    }

    /// Converts the first page of `file` into `svg_path`
    pub async fn generate(&self, file: &str, svg_path: &Path) -> Result<i32, ProcessError> {
        let run = ProcessRun::new(
            &self.config.svg_tool,
            vec![file.to_string(), svg_path.display().to_string()],
            Duration::from_millis(self.config.timeout_ms),
            LABEL,
        );
        self.runner.run(run).await
    }
}
