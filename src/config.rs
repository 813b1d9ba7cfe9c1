use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::{builtin_models, ModelDescriptor, ModelRegistry};
use crate::pipeline::PipelineOptions;
use crate::scanner::default_screenshot_dirs;

const APP_DIR: &str = "screenshot-organizer";

pub const ENV_DB: &str = "SCREENSHOT_ORGANIZER_DB";
pub const ENV_MODELS_DIR: &str = "SCREENSHOT_ORGANIZER_MODELS_DIR";
pub const ENV_LLM_URL: &str = "SCREENSHOT_ORGANIZER_LLM_URL";
pub const ENV_AUTH_TOKEN: &str = "HF_TOKEN";

/// Everything in the config file is optional and layered over defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    db_path: Option<PathBuf>,
    models_dir: Option<PathBuf>,
    screenshot_dirs: Option<Vec<PathBuf>>,
    pipeline: Option<PipelineOptions>,
    llm_server_url: Option<String>,
    preferred_model: Option<String>,
    auth_token: Option<String>,
    extra_models: Vec<ModelDescriptor>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Config {
    pub db_path: PathBuf,
    pub models_dir: PathBuf,
    pub screenshot_dirs: Vec<PathBuf>,
    pub pipeline: PipelineOptions,
    /// OpenAI-compatible server that serves the local model.
    pub llm_server_url: Option<String>,
    pub preferred_model: Option<String>,
    #[serde(skip_serializing)]
    pub auth_token: Option<String>,
    pub extra_models: Vec<ModelDescriptor>,
}

impl Config {
    /// Defaults rooted at `home`.
    pub fn defaults(home: &Path) -> Self {
        let data_dir = home.join(".local").join("share").join(APP_DIR);
        Self {
            db_path: data_dir.join("catalog.db"),
            models_dir: data_dir.join("models"),
            screenshot_dirs: default_screenshot_dirs(home),
            pipeline: PipelineOptions::default(),
            llm_server_url: None,
            preferred_model: None,
            auth_token: None,
            extra_models: Vec::new(),
        }
    }

    pub fn default_config_path(home: &Path) -> PathBuf {
        home.join(".config").join(APP_DIR).join("config.json")
    }

    /// Resolves the configuration from `HOME`, an optional JSON file and the
    /// process environment. An explicitly named file must exist.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let Ok(home) = std::env::var("HOME") else {
            return Err(Error::Config("HOME environment variable not set".to_string()));
        };
        let home = PathBuf::from(home);

        let file_path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => Some(Self::default_config_path(&home)).filter(|path| path.is_file()),
        };
        let contents = match &file_path {
            Some(path) => {
                debug!("reading config from {}", path.display());
                Some(fs::read_to_string(path)?)
            }
            None => None,
        };

        Self::from_sources(&home, contents.as_deref(), |key| std::env::var(key).ok())
    }

    /// Layers defaults, then file contents, then environment overrides.
    pub fn from_sources(
        home: &Path,
        file: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut config = Self::defaults(home);

        if let Some(contents) = file {
            let parsed: ConfigFile = serde_json::from_str(contents)
                .map_err(|error| Error::Config(format!("config file: {error}")))?;
            if let Some(db_path) = parsed.db_path {
                config.db_path = db_path;
            }
            if let Some(models_dir) = parsed.models_dir {
                config.models_dir = models_dir;
            }
            if let Some(dirs) = parsed.screenshot_dirs {
                config.screenshot_dirs = dirs;
            }
            if let Some(pipeline) = parsed.pipeline {
                config.pipeline = pipeline;
            }
            config.llm_server_url = parsed.llm_server_url;
            config.preferred_model = parsed.preferred_model;
            config.auth_token = parsed.auth_token;
            config.extra_models = parsed.extra_models;
        }

        let env = |key: &str| env(key).filter(|value| !value.trim().is_empty());
        if let Some(db_path) = env(ENV_DB) {
            config.db_path = PathBuf::from(db_path);
        }
        if let Some(models_dir) = env(ENV_MODELS_DIR) {
            config.models_dir = PathBuf::from(models_dir);
        }
        if let Some(url) = env(ENV_LLM_URL) {
            config.llm_server_url = Some(url);
        }
        if let Some(token) = env(ENV_AUTH_TOKEN) {
            config.auth_token = Some(token);
        }

        if config.pipeline.batch_size == 0 {
            return Err(Error::Config("pipeline.batch_size must be at least 1".to_string()));
        }
        Ok(config)
    }

    pub fn registry(&self) -> ModelRegistry {
        let mut models = builtin_models();
        for extra in &self.extra_models {
            models.retain(|model| model.name != extra.name);
            models.push(extra.clone());
        }
        ModelRegistry::new(&self.models_dir, models)
    }
}
