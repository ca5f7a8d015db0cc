//! Helm values templating

use std::path::Path;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_yaml::{Mapping, Value};
use tracing::{info, warn};

use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::models::deployment::DeploymentParams;

/// Writes resolved model parameters into the stack's configuration file
#[async_trait]
pub trait ConfigTemplater: Send + Sync {
    async fn apply(&self, path: &Path, params: &DeploymentParams) -> Result<(), DeployError>;
}

/// Templater for the chart's `values.yaml`
#[derive(Debug, Clone, Default)]
pub struct ValuesTemplater;

impl ValuesTemplater {
    pub fn new() -> Self {
        Self
    }

    /// Parse the file without changing it
    pub async fn validate(&self, path: &Path) -> Result<(), DeployError> {
        let content = File::new(path).read_string().await?;
        parse(&content, path).map(|_| ())
    }

    /// Copy the file to `<path>.backup.<millis>`
    pub async fn backup(&self, path: &Path) -> Result<File, DeployError> {
        let backup_path = format!(
            "{}.backup.{}",
            path.display(),
            chrono::Utc::now().timestamp_millis()
        );
        File::new(path).copy_to(backup_path).await
    }

    pub async fn restore(&self, path: &Path, backup: &File) -> Result<(), DeployError> {
        backup.copy_to(path).await?;
        Ok(())
    }
}

fn parse(content: &str, path: &Path) -> Result<Value, DeployError> {
    serde_yaml::from_str(content).map_err(|e| {
        DeployError::ConfigError(format!("{} is not valid YAML: {}", path.display(), e))
    })
}

fn string(value: &str) -> Value {
    Value::String(value.to_string())
}

fn model_sections(params: &DeploymentParams) -> [(&'static str, Mapping); 3] {
    let main = params.main_model();
    let embedding = params.embedding_model();

    let mut answer = Mapping::new();
    answer.insert(string("endpoint"), string(&main.endpoint));
    answer.insert(string("key"), string(main.key.expose_secret()));
    answer.insert(string("name"), string(&main.name));
    answer.insert(string("ctxLength"), Value::from(main.ctx_length));
    answer.insert(string("maxTokens"), Value::from(main.max_tokens));

    let mut function_call = Mapping::new();
    function_call.insert(string("backend"), string("function_call"));
    for (key, value) in &answer {
        function_call.insert(key.clone(), value.clone());
    }

    let mut embedding_section = Mapping::new();
    embedding_section.insert(string("type"), string(embedding.embedding_type.as_str()));
    embedding_section.insert(string("endpoint"), string(&embedding.endpoint));
    embedding_section.insert(string("key"), string(embedding.key.expose_secret()));
    embedding_section.insert(string("name"), string(&embedding.name));

    [
        ("answer", answer),
        ("functionCall", function_call),
        ("embedding", embedding_section),
    ]
}

/// Replace the model sections of a parsed values document
pub fn render_models(document: Value, params: &DeploymentParams) -> Result<Value, DeployError> {
    let mut root = match document {
        Value::Mapping(root) => root,
        Value::Null => Mapping::new(),
        _ => {
            return Err(DeployError::ConfigError(
                "values root must be a mapping".to_string(),
            ))
        }
    };

    let models = root
        .entry(string("models"))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if !models.is_mapping() {
        *models = Value::Mapping(Mapping::new());
    }
    if let Value::Mapping(models) = models {
        for (name, section) in model_sections(params) {
            models.insert(string(name), Value::Mapping(section));
        }
    }

    Ok(Value::Mapping(root))
}

#[async_trait]
impl ConfigTemplater for ValuesTemplater {
    async fn apply(&self, path: &Path, params: &DeploymentParams) -> Result<(), DeployError> {
        let file = File::new(path);
        let content = file.read_string().await?;
        let document = render_models(parse(&content, path)?, params)?;
        let rendered = serde_yaml::to_string(&document)?;

        let backup = self.backup(path).await?;
        if let Err(e) = file.write_atomic(rendered.as_bytes()).await {
            warn!("Writing {} failed, restoring backup: {}", path.display(), e);
            if let Err(restore_err) = self.restore(path, &backup).await {
                warn!("Restoring {} failed: {}", path.display(), restore_err);
            }
            return Err(e);
        }

        info!(
            "Model configuration written to {} (backup at {})",
            path.display(),
            backup.path().display()
        );
        Ok(())
    }
}
