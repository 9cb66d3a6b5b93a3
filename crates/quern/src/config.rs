//! YAML configuration with environment overrides.
//!
//! Every section and field has a default, so an empty or missing file
//! yields a runnable (fixture-backed) service. Secrets never live in the
//! file: the API key and artifact credentials come from the environment.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

const CONFIG_PATH_ENV: &str = "QUERN_CONFIG";
const API_KEY_ENV: &str = "QUERN_API_KEY";
const ARTIFACT_LOGIN_ENV: &str = "QUERN_ARTIFACT_LOGIN";
const ARTIFACT_PASSWORD_ENV: &str = "QUERN_ARTIFACT_PASSWORD";

const CANDIDATE_PATHS: &[&str] = &["config.yaml", "config/config.yaml"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    /// Path to the model weights. Empty means no real backend is
    /// configured and the service falls back to the fixture backend.
    pub path: String,
    pub name: String,
    pub pool_size: usize,
    pub ctx_size: u32,
    pub gpu_layers: u32,
    pub n_threads: Option<u32>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            path: String::new(),
            name: "local-model".to_string(),
            pool_size: 1,
            ctx_size: 4096,
            gpu_layers: 0,
            n_threads: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub default_temperature: f32,
    pub default_max_tokens: u32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            default_temperature: 0.7,
            default_max_tokens: 256,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    pub enabled: bool,
    #[serde(skip)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CorsSettings {
    pub allowed_origins: Vec<String>,
}

impl Default for CorsSettings {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_string()],
        }
    }
}

/// Where to fetch model weights from when they are not already on disk.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ArtifactSettings {
    pub enabled: bool,
    pub url: String,
    pub repository: String,
    pub artifact_id: String,
    pub version: String,
    pub file_name: String,
    #[serde(skip)]
    pub login: Option<String>,
    #[serde(skip)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub model: ModelSettings,
    pub generation: GenerationSettings,
    pub security: SecuritySettings,
    pub cors: CorsSettings,
    pub artifact: ArtifactSettings,
}

impl Settings {
    /// Load settings from `path` if given, else from `QUERN_CONFIG`, else
    /// from the first candidate file that exists, else defaults. Secrets
    /// are then filled in from the environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut settings = match Self::resolve_path(path) {
            Some(file) => {
                let raw = std::fs::read_to_string(&file)
                    .with_context(|| format!("reading config file {}", file.display()))?;
                let settings: Settings = serde_yaml::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", file.display()))?;
                tracing::info!(path = %file.display(), "loaded configuration");
                settings
            }
            None => {
                tracing::info!("no config file found, using defaults");
                Settings::default()
            }
        };

        settings.security.api_key = std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty());
        settings.artifact.login = std::env::var(ARTIFACT_LOGIN_ENV).ok();
        settings.artifact.password = std::env::var(ARTIFACT_PASSWORD_ENV).ok();

        if settings.security.enabled && settings.security.api_key.is_none() {
            tracing::warn!(
                "security is enabled but {API_KEY_ENV} is not set, all requests will be rejected"
            );
        }
        Ok(settings)
    }

    fn resolve_path(path: Option<&Path>) -> Option<PathBuf> {
        if let Some(p) = path {
            return Some(p.to_path_buf());
        }
        if let Ok(p) = std::env::var(CONFIG_PATH_ENV) {
            return Some(PathBuf::from(p));
        }
        CANDIDATE_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    }
}
