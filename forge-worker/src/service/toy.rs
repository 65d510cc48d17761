//! Toy model import
//!
//! A toy model is a directory of JSON exports, one `<collection>.json` per
//! collection. Importing it runs the bulk loader once per file, all files at
//! once, into `<model>.<collection>` of the target database.

use async_trait::async_trait;
use forge_core::codes;
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};

use crate::config::ToyConfig;
use crate::process::{ProcessError, ProcessRun, ProcessRunner};

const LABEL: &str = "TOY";

/// Ways a toy import can fail
#[derive(Debug, Error)]
pub enum ToyImportError {
    #[error("Invalid toy model id: {0}")]
    InvalidId(String),

    #[error("Failed to read toy model directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Toy model directory {0} holds no collection files")]
    Empty(PathBuf),

    #[error("Failed to import collection {collection}: {source}")]
    Collection {
        collection: String,
        #[source]
        source: ProcessError,
    },
}

impl ToyImportError {
    pub fn code(&self) -> i32 {
        codes::TOY_IMPORT_FAILED
    }
}

/// Loads toy models into a database
#[async_trait]
pub trait ToyImporter: Send + Sync {
    /// Imports toy model `toy_model_id` as `database`/`model`
    async fn import(
        &self,
        toy_model_id: &str,
        database: &str,
        model: &str,
    ) -> Result<(), ToyImportError>;
}

/// [`ToyImporter`] driving `mongoimport`
pub struct MongoToyImporter {
    runner: Arc<dyn ProcessRunner>,
    config: ToyConfig,
}

impl MongoToyImporter {
    pub fn new(runner: Arc<dyn ProcessRunner>, config: ToyConfig) -> Self {
        Self { runner, config }
    }

    fn loader_run(&self, database: &str, collection: &str, file: &Path) -> ProcessRun {
        let db = &self.config.db;
        let arguments = vec![
            "-j".to_string(),
            "8".to_string(),
            "--host".to_string(),
            format!("{}:{}", db.host, db.port),
            "--username".to_string(),
            db.username.clone(),
            "--password".to_string(),
            db.password.clone(),
            "--authenticationDatabase".to_string(),
            "admin".to_string(),
            "--db".to_string(),
            database.to_string(),
            "--collection".to_string(),
            collection.to_string(),
            "--writeConcern".to_string(),
            self.config.write_concern.to_string(),
            "--file".to_string(),
            file.display().to_string(),
        ];

        ProcessRun::new(
            &self.config.mongoimport,
            arguments,
            Duration::from_millis(self.config.timeout_ms),
            LABEL,
        )
    }
}

#[async_trait]
impl ToyImporter for MongoToyImporter {
    async fn import(
        &self,
        toy_model_id: &str,
        database: &str,
        model: &str,
    ) -> Result<(), ToyImportError> {
        if !is_plain_name(toy_model_id) {
            return Err(ToyImportError::InvalidId(toy_model_id.to_string()));
        }

        let dir = self.config.root.join(toy_model_id);
        let files = collection_files(&dir).await?;
        info!(
            "Importing toy model {} into {}.{} ({} collections)",
            toy_model_id,
            database,
            model,
            files.len()
        );

        let imports = files.into_iter().map(|(name, file)| async move {
            let collection = format!("{}.{}", model, name);
            let run = self.loader_run(database, &collection, &file);
            self.runner.run(run).await.map_err(|source| {
                error!(
                    "Failed to run mongoimport on {}:{} with data from {}",
                    database,
                    collection,
                    file.display()
                );
                ToyImportError::Collection { collection, source }
            })
        });

        for result in join_all(imports).await {
            result?;
        }

        info!("Toy model {} imported", toy_model_id);
        Ok(())
    }
}

/// Collection name and path of every `.json` file in `dir`, sorted by name
async fn collection_files(dir: &Path) -> Result<Vec<(String, PathBuf)>, ToyImportError> {
    let directory_error = |source| ToyImportError::Directory {
        path: dir.to_path_buf(),
        source,
    };

    let mut entries = tokio::fs::read_dir(dir).await.map_err(directory_error)?;
    let mut files = Vec::new();

    while let Some(entry) = entries.next_entry().await.map_err(directory_error)? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
            files.push((stem.to_string(), path.clone()));
        }
    }

    if files.is_empty() {
        return Err(ToyImportError::Empty(dir.to_path_buf()));
    }

    files.sort();
    Ok(files)
}

/// Whether `id` names a single directory entry
fn is_plain_name(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains(['/', '\\'])
}
