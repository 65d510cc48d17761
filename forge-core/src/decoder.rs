//! Message decoder
//!
//! Parses the space-delimited command carried by a queue message into a
//! [`TaskDescriptor`]. Some commands point at side-loaded JSON parameter files;
//! those are read as data with a fixed schema, never evaluated.
//!
//! Callers on other hosts write paths under [`SHARED_DATA_PLACEHOLDER`]. When a
//! local shared directory is configured, the placeholder is replaced before any
//! path is used. For `import` the parameter file itself is rewritten too, since
//! the converter reads it directly.

use serde::Deserialize;
use std::path::Path;
use tracing::debug;

use crate::domain::task::{SkipStages, TaskDescriptor, TaskKind};
use crate::error::DecodeError;

/// Shared storage root as written by message producers
pub const SHARED_DATA_PLACEHOLDER: &str = "/sharedData/";

/// Settings the decoder needs from the worker configuration
#[derive(Debug, Clone, Default)]
pub struct DecoderSettings {
    /// Local path standing in for [`SHARED_DATA_PLACEHOLDER`]
    pub shared_dir: Option<String>,
}

/// Parameter file used by `import`, `genFed` and `genAssetBundles`
#[derive(Debug, Deserialize)]
struct ModelParams {
    database: String,
    project: String,
    #[serde(default)]
    owner: Option<String>,
    /// Either a toy directory name or `false`
    #[serde(default, rename = "toyFed")]
    toy_fed: Option<serde_json::Value>,
}

/// Parameter file used by `processDrawing`
#[derive(Debug, Deserialize)]
struct DrawingParams {
    database: String,
    project: String,
    #[serde(default)]
    owner: Option<String>,
    #[serde(rename = "revId")]
    revision_id: String,
    file: String,
    format: String,
    #[serde(default)]
    size: Option<u64>,
}

/// Decodes raw queue commands into task descriptors
#[derive(Debug, Clone, Default)]
pub struct Decoder {
    settings: DecoderSettings,
}

impl Decoder {
    pub fn new(settings: DecoderSettings) -> Self {
        Self { settings }
    }

    /// Decodes one command
    ///
    /// Never panics: every malformed command, unknown command, or unreadable
    /// parameter file comes back as a [`DecodeError`].
    ///
    /// # Arguments
    /// * `raw` - The message body
    /// * `correlation_id` - Correlation identifier of the delivery
    pub fn decode(&self, raw: &str, correlation_id: &str) -> Result<TaskDescriptor, DecodeError> {
        let command = self.substitute(raw.trim());
        let tokens: Vec<String> = command.split_whitespace().map(str::to_string).collect();

        let first = tokens
            .first()
            .ok_or_else(|| DecodeError::new("empty command"))?;

        let (database, model, owner, kind) = match first.as_str() {
            "import" => {
                let param_file = token(&tokens, 2, "parameter file")?;
                self.rewrite_param_file(&param_file)?;
                let params: ModelParams = read_params(&param_file)?;
                (
                    params.database,
                    params.project,
                    params.owner,
                    TaskKind::Import { param_file },
                )
            }
            "genFed" => {
                let param_file = token(&tokens, 1, "parameter file")?;
                let params: ModelParams = read_params(&param_file)?;
                let toy_federation = match params.toy_fed {
                    Some(serde_json::Value::String(dir)) if !dir.is_empty() => Some(dir),
                    _ => None,
                };
                (
                    params.database,
                    params.project,
                    params.owner,
                    TaskKind::GenerateFederation {
                        param_file,
                        toy_federation,
                    },
                )
            }
            "importToy" => {
                let database = token(&tokens, 1, "database")?;
                let model = token(&tokens, 2, "model")?;
                let toy_model_id = token(&tokens, 3, "toy model")?;
                let skip_stages = match tokens.get(4) {
                    Some(raw_skip) => parse_skip_stages(raw_skip)?,
                    None => SkipStages::new(),
                };
                (
                    database,
                    model,
                    None,
                    TaskKind::ImportToy {
                        toy_model_id,
                        skip_stages,
                    },
                )
            }
            "genStash" => {
                let database = token(&tokens, 1, "database")?;
                let model = token(&tokens, 2, "model")?;
                let stash_type = tokens.get(3).cloned().unwrap_or_else(|| "tree".to_string());
                let revision = tokens.get(4).cloned().unwrap_or_else(|| "all".to_string());
                (
                    database,
                    model,
                    None,
                    TaskKind::GenerateStash {
                        stash_type,
                        revision,
                    },
                )
            }
            "processDrawing" => {
                let param_file = token(&tokens, 1, "parameter file")?;
                let params: DrawingParams = read_params(&param_file)?;
                (
                    params.database,
                    params.project,
                    params.owner,
                    TaskKind::ProcessDrawing {
                        param_file,
                        revision_id: params.revision_id,
                        drawing_format: params.format.to_lowercase(),
                        file: self.substitute(&params.file),
                        file_size: params.size,
                    },
                )
            }
            "genAssetBundles" => {
                let param_file = token(&tokens, 1, "parameter file")?;
                let upstream_code = token(&tokens, 2, "upstream code")?
                    .parse::<i32>()
                    .map_err(|e| DecodeError::new(format!("invalid upstream code: {}", e)))?;
                let params: ModelParams = read_params(&param_file)?;
                (
                    params.database,
                    params.project,
                    params.owner,
                    TaskKind::GenerateAssetBundle {
                        param_file,
                        upstream_code,
                    },
                )
            }
            other => {
                return Err(DecodeError::new(format!("unrecognised command '{}'", other)));
            }
        };

        Ok(TaskDescriptor {
            correlation_id: correlation_id.to_string(),
            database,
            model,
            owner,
            command: tokens,
            kind,
        })
    }

    /// Replaces the shared storage placeholder with the local shared directory
    pub fn substitute(&self, text: &str) -> String {
        match &self.settings.shared_dir {
            Some(shared_dir) => {
                let mut local = shared_dir.clone();
                if !local.ends_with('/') && !local.ends_with('\\') {
                    local.push('/');
                }
                text.replace(SHARED_DATA_PLACEHOLDER, &local)
            }
            None => text.to_string(),
        }
    }

    /// Rewrites placeholder paths inside a parameter file the converter reads
    fn rewrite_param_file(&self, path: &str) -> Result<(), DecodeError> {
        if self.settings.shared_dir.is_none() {
            return Ok(());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| DecodeError::new(format!("failed to read {}: {}", path, e)))?;
        let resolved = self.substitute(&content);

        if resolved != content {
            debug!("Rewriting shared paths in {}", path);
            std::fs::write(path, resolved)
                .map_err(|e| DecodeError::new(format!("failed to rewrite {}: {}", path, e)))?;
        }

        Ok(())
    }
}

fn token(tokens: &[String], index: usize, what: &str) -> Result<String, DecodeError> {
    tokens
        .get(index)
        .cloned()
        .ok_or_else(|| DecodeError::new(format!("missing {} (argument {})", what, index)))
}

fn read_params<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, DecodeError> {
    let content = std::fs::read_to_string(Path::new(path))
        .map_err(|e| DecodeError::new(format!("failed to read {}: {}", path, e)))?;
    serde_json::from_str(&content)
        .map_err(|e| DecodeError::new(format!("failed to parse {}: {}", path, e)))
}

fn parse_skip_stages(raw: &str) -> Result<SkipStages, DecodeError> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|e| DecodeError::new(format!("invalid skip stages '{}': {}", raw, e)))?;
    SkipStages::from_json(&value)
        .ok_or_else(|| DecodeError::new(format!("skip stages must be an object, got '{}'", raw)))
}
