//! Deployment input models

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::errors::DeployError;

/// Default context length for the answer model
pub const DEFAULT_CTX_LENGTH: u32 = 8192;

/// Default completion budget for the answer model
pub const DEFAULT_MAX_TOKENS: u32 = 2048;

/// One model section of the deployment form, as typed by the operator
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelForm {
    pub url: String,
    pub model_name: String,
    pub api_key: String,
}

/// Raw deployment form: answer model plus embedding model
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeploymentForm {
    pub main: ModelForm,
    pub embedding: ModelForm,
}

/// Answer (chat) model endpoint
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub endpoint: String,
    pub key: SecretString,
    pub name: String,
    pub ctx_length: u32,
    pub max_tokens: u32,
}

/// Embedding backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingType {
    OpenAi,
}

impl EmbeddingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmbeddingType::OpenAi => "openai",
        }
    }
}

/// Embedding model endpoint
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub embedding_type: EmbeddingType,
    pub endpoint: String,
    pub key: SecretString,
    pub name: String,
}

/// Validated, immutable input for one deployment run
#[derive(Debug, Clone)]
pub struct DeploymentParams {
    main_model: ModelConfig,
    embedding_model: EmbeddingConfig,
}

impl DeploymentParams {
    /// Validate and build parameters
    pub fn new(main_model: ModelConfig, embedding_model: EmbeddingConfig) -> Result<Self, DeployError> {
        let params = Self {
            main_model,
            embedding_model,
        };
        params.validate()?;
        Ok(params)
    }

    pub fn main_model(&self) -> &ModelConfig {
        &self.main_model
    }

    pub fn embedding_model(&self) -> &EmbeddingConfig {
        &self.embedding_model
    }

    fn validate(&self) -> Result<(), DeployError> {
        let main = &self.main_model;
        let embedding = &self.embedding_model;

        require(&main.endpoint, "main model URL")?;
        require(&main.name, "main model name")?;
        require(main.key.expose_secret(), "main model API key")?;
        require(&embedding.endpoint, "embedding model URL")?;
        require(&embedding.name, "embedding model name")?;
        require(embedding.key.expose_secret(), "embedding model API key")?;

        for endpoint in [&main.endpoint, &embedding.endpoint] {
            url::Url::parse(endpoint).map_err(|e| {
                DeployError::ValidationError(format!("Invalid URL '{}': {}", endpoint, e))
            })?;
        }

        if main.ctx_length == 0 || main.max_tokens == 0 {
            return Err(DeployError::ValidationError(
                "main model token limits must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn require(value: &str, what: &str) -> Result<(), DeployError> {
    if value.trim().is_empty() {
        return Err(DeployError::ValidationError(format!("{} must not be empty", what)));
    }
    Ok(())
}

/// Normalize an endpoint: drop trailing slashes, default to https
pub fn format_endpoint(url: &str) -> Result<String, DeployError> {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(DeployError::ValidationError("URL must not be empty".to_string()));
    }

    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("https://{}", trimmed))
    }
}

impl TryFrom<DeploymentForm> for DeploymentParams {
    type Error = DeployError;

    fn try_from(form: DeploymentForm) -> Result<Self, Self::Error> {
        let main_model = ModelConfig {
            endpoint: format_endpoint(&form.main.url)?,
            key: SecretString::from(form.main.api_key),
            name: form.main.model_name.trim().to_string(),
            ctx_length: DEFAULT_CTX_LENGTH,
            max_tokens: DEFAULT_MAX_TOKENS,
        };
        let embedding_model = EmbeddingConfig {
            embedding_type: EmbeddingType::OpenAi,
            endpoint: format_endpoint(&form.embedding.url)?,
            key: SecretString::from(form.embedding.api_key),
            name: form.embedding.model_name.trim().to_string(),
        };
        DeploymentParams::new(main_model, embedding_model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form() -> DeploymentForm {
        DeploymentForm {
            main: ModelForm {
                url: "llm.example.com/v1/".to_string(),
                model_name: "qwen".to_string(),
                api_key: "sk-main".to_string(),
            },
            embedding: ModelForm {
                url: "http://embed.example.com:8000/v1".to_string(),
                model_name: "bge".to_string(),
                api_key: "sk-embed".to_string(),
            },
        }
    }

    #[test]
    fn test_format_endpoint() {
        assert_eq!(format_endpoint("example.com//").unwrap(), "https://example.com");
        assert_eq!(format_endpoint("HTTP://example.com").unwrap(), "HTTP://example.com");
        assert!(format_endpoint("   ").is_err());
    }

    #[test]
    fn test_form_conversion_applies_defaults() {
        let params = DeploymentParams::try_from(form()).unwrap();
        assert_eq!(params.main_model().endpoint, "https://llm.example.com/v1");
        assert_eq!(params.main_model().ctx_length, DEFAULT_CTX_LENGTH);
        assert_eq!(params.main_model().max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(params.embedding_model().embedding_type, EmbeddingType::OpenAi);
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let mut form = form();
        form.embedding.api_key.clear();
        let err = DeploymentParams::try_from(form).unwrap_err();
        assert!(err.to_string().contains("embedding model API key"));
    }

    #[test]
    fn test_debug_does_not_leak_keys() {
        let params = DeploymentParams::try_from(form()).unwrap();
        let debug = format!("{:?}", params);
        assert!(!debug.contains("sk-main"));
    }
}
