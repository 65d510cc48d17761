//! Converter service
//!
//! Every converter call takes the converter configuration file as its first
//! argument. The environment of each call is built here:
//! - operator-declared extra variables
//! - `REPO_LOG_DIR` for the task
//! - `REPO_LICENSE` / `REPO_INSTANCE_ID` when the worker is licensed

use std::path::Path;
use std::sync::Arc;
use tracing::{error, info};

use crate::config::ConverterConfig;
use crate::process::{ProcessError, ProcessRun, ProcessRunner};

const LABEL: &str = "CONVERTER";

pub struct ConverterService {
    runner: Arc<dyn ProcessRunner>,
    config: ConverterConfig,
    repo_license: Option<String>,
    instance_id: Option<String>,
}

impl ConverterService {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        config: ConverterConfig,
        repo_license: Option<String>,
        instance_id: Option<String>,
    ) -> Self {
        Self {
            runner,
            config,
            repo_license,
            instance_id,
        }
    }

    /// Configuration file passed as the leading argument
    pub fn config_path(&self) -> &str {
        &self.config.config_path
    }

    /// Whether runs carry a licence key
    pub fn licensed(&self) -> bool {
        self.repo_license.is_some()
    }

    /// Runs the converter with a full argument list
    ///
    /// Soft-fail exit codes resolve as success.
    ///
    /// # Arguments
    /// * `arguments` - Arguments, configuration file first
    /// * `log_dir` - Log directory of the task
    pub async fn run(&self, arguments: Vec<String>, log_dir: &Path) -> Result<i32, ProcessError> {
        let run = self.prepare(arguments, Some(log_dir));
        self.runner.run(run).await
    }

    /// Regenerates a stash of an existing model
    pub async fn generate_stash(
        &self,
        log_dir: &Path,
        database: &str,
        model: &str,
        stash_type: &str,
        revision: &str,
    ) -> Result<i32, ProcessError> {
        let arguments = vec![
            self.config.config_path.clone(),
            "genStash".to_string(),
            database.to_string(),
            model.to_string(),
            stash_type.to_string(),
            revision.to_string(),
        ];
        self.run(arguments, log_dir).await
    }

    /// Checks that the converter starts and accepts its configuration
    pub async fn self_test(&self) -> Result<i32, ProcessError> {
        info!("Checking status of converter...");

        let arguments = vec![self.config.config_path.clone(), "test".to_string()];
        match self.runner.run(self.prepare(arguments, None)).await {
            Ok(code) => {
                info!("Converter call passed");
                Ok(code)
            }
            Err(e) => {
                error!("Converter call errored (Error code: {})", e.code());
                Err(e)
            }
        }
    }

    fn prepare(&self, arguments: Vec<String>, log_dir: Option<&Path>) -> ProcessRun {
        let mut run = ProcessRun::new(
            &self.config.path,
            arguments,
            self.config.timeout(),
            LABEL,
        )
        .with_success_codes(&self.config.soft_fails);

        for (key, value) in &self.config.envars {
            run = run.with_env(key, value);
        }
        if let Some(log_dir) = log_dir {
            run = run.with_env("REPO_LOG_DIR", log_dir.display().to_string());
        }
        if let Some(license) = &self.repo_license {
            run = run.with_env("REPO_LICENSE", license);
        }
        if let Some(instance_id) = &self.instance_id {
            run = run.with_env("REPO_INSTANCE_ID", instance_id);
        }

        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CapturingRunner(Mutex<Vec<ProcessRun>>);

    #[async_trait]
    impl ProcessRunner for CapturingRunner {
        async fn run(&self, run: ProcessRun) -> Result<i32, ProcessError> {
            self.0.lock().unwrap().push(run);
            Ok(0)
        }
    }

    fn service(runner: Arc<CapturingRunner>, license: Option<&str>) -> ConverterService {
        let config = ConverterConfig {
            path: PathBuf::from("/opt/converter"),
            config_path: "/etc/converter.json".to_string(),
            timeout_ms: 1000,
            envars: HashMap::from([("EXTRA".to_string(), "1".to_string())]),
            soft_fails: vec![7, 10, 15],
        };
        ConverterService::new(runner, config, license.map(str::to_string), None)
    }

    #[tokio::test]
    async fn test_generate_stash_arguments_and_env() {
        let runner = Arc::new(CapturingRunner::default());
        let service = service(runner.clone(), Some("key"));

        service
            .generate_stash(Path::new("/logs/t1"), "teamspace1", "model1", "tree", "all")
            .await
            .unwrap();

        let runs = runner.0.lock().unwrap();
        let run = &runs[0];
        assert_eq!(
            run.arguments,
            vec!["/etc/converter.json", "genStash", "teamspace1", "model1", "tree", "all"]
        );
        assert_eq!(run.success_codes, vec![7, 10, 15]);
        assert_eq!(run.env.get("REPO_LOG_DIR").map(String::as_str), Some("/logs/t1"));
        assert_eq!(run.env.get("REPO_LICENSE").map(String::as_str), Some("key"));
        assert_eq!(run.env.get("EXTRA").map(String::as_str), Some("1"));
        assert!(service.licensed());
    }

    #[tokio::test]
    async fn test_self_test_has_no_log_dir() {
        let runner = Arc::new(CapturingRunner::default());
        let service = service(runner.clone(), None);

        service.self_test().await.unwrap();

        let runs = runner.0.lock().unwrap();
        assert_eq!(runs[0].arguments, vec!["/etc/converter.json", "test"]);
        assert!(!runs[0].env.contains_key("REPO_LOG_DIR"));
        assert!(!runs[0].env.contains_key("REPO_LICENSE"));
    }
}
