use std::{
    fs,
    ops::AddAssign,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, ensure};
use gemma_vlm_core::{
    DecodeParameters, PromptSettings, PromptStrategy, conversation::get_conv_template,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::fs::{VirtualFileSystem, VirtualPath};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub model: ModelSettings,
    pub inference: InferenceSettings,
    pub server: ServerSettings,
}

/// Where the exported program and its processor assets live, and how prompts
/// are built for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub id: String,
    pub program: Option<PathBuf>,
    pub processor: Option<PathBuf>,
    pub tokenizer: Option<PathBuf>,
    pub template: String,
    pub prompt_strategy: PromptStrategy,
    pub system_prompt: Option<String>,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            id: "gemma3-4b".to_string(),
            program: None,
            processor: None,
            tokenizer: None,
            template: "gemma3".to_string(),
            prompt_strategy: PromptStrategy::Auto,
            system_prompt: None,
        }
    }
}

impl ModelSettings {
    pub fn prompt_settings(&self) -> PromptSettings {
        PromptSettings {
            strategy: self.prompt_strategy,
            template: self.template.clone(),
            system_prompt: self.system_prompt.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceSettings {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub seed: Option<u64>,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            max_new_tokens: 100,
            temperature: 0.0,
            seed: None,
        }
    }
}

impl InferenceSettings {
    pub fn decode_parameters(&self) -> DecodeParameters {
        DecodeParameters {
            max_new_tokens: self.max_new_tokens,
            temperature: self.temperature,
            seed: self.seed,
        }
    }
}

/// HTTP listener settings plus the defaults applied to requests that omit
/// `max_new_tokens` or `temperature`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub cors_origins: Vec<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            max_new_tokens: 256,
            temperature: 0.7,
            cors_origins: vec![
                "http://localhost:5173".to_string(),
                "http://127.0.0.1:5173".to_string(),
                "http://localhost:3000".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResourceLocation {
    Virtual(VirtualPath),
    Physical(PathBuf),
}

impl ResourceLocation {
    pub fn join(&self, segment: &str) -> Self {
        match self {
            ResourceLocation::Virtual(path) => ResourceLocation::Virtual(path.join(segment)),
            ResourceLocation::Physical(path) => ResourceLocation::Physical(path.join(segment)),
        }
    }

    pub fn to_path_buf(&self, fs: &impl VirtualFileSystem) -> PathBuf {
        match self {
            ResourceLocation::Virtual(path) => fs.locate(path),
            ResourceLocation::Physical(path) => path.clone(),
        }
    }

    pub fn display_with(&self, fs: &impl VirtualFileSystem) -> String {
        self.to_path_buf(fs).display().to_string()
    }
}

/// Fully resolved locations of everything a runner needs for one model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelResources {
    pub id: String,
    pub program: ResourceLocation,
    pub processor: ResourceLocation,
    pub tokenizer: ResourceLocation,
    pub prompt: PromptSettings,
}

#[derive(Debug, Clone)]
pub struct ConfigDescriptor {
    pub location: ResourceLocation,
}

impl AppConfig {
    pub fn load_or_init(
        fs: &impl VirtualFileSystem,
        override_path: Option<&Path>,
    ) -> Result<(Self, ConfigDescriptor)> {
        match override_path {
            Some(path) => load_physical_config(fs, path),
            None => load_virtual_config(fs),
        }
    }

    pub fn load_with_overrides(
        fs: &impl VirtualFileSystem,
        overrides: ConfigOverrides,
    ) -> Result<(Self, ConfigDescriptor, ModelResources)> {
        let config_path_override = overrides.config_path.clone();
        let (mut config, descriptor) = Self::load_or_init(fs, config_path_override.as_deref())?;
        config += overrides;
        config.normalise(fs)?;
        let resources = config.model_resources();
        Ok((config, descriptor, resources))
    }

    /// Validates values and anchors relative model paths in the model's
    /// directory under the models root.
    pub fn normalise(&mut self, fs: &impl VirtualFileSystem) -> Result<()> {
        ensure!(
            !self.model.id.trim().is_empty(),
            "model id must not be empty"
        );
        ensure!(
            get_conv_template(&self.model.template).is_some(),
            "unknown conversation template `{}`",
            self.model.template
        );
        validate_temperature("inference.temperature", self.inference.temperature)?;
        validate_temperature("server.temperature", self.server.temperature)?;

        let model_dir = VirtualPath::model_dir(&self.model.id);
        fs.ensure_dir(&model_dir)?;
        let model_root = fs.locate(&model_dir);
        for slot in [
            &mut self.model.program,
            &mut self.model.processor,
            &mut self.model.tokenizer,
        ] {
            if let Some(path) = slot.as_mut().filter(|path| path.is_relative()) {
                let anchored = model_root.join(&*path);
                debug!(from = %path.display(), to = %anchored.display(), "resolved model path");
                *path = anchored;
            }
        }
        Ok(())
    }

    pub fn model_resources(&self) -> ModelResources {
        let id = self.model.id.clone();
        let program = match &self.model.program {
            Some(path) => ResourceLocation::Physical(path.clone()),
            None => ResourceLocation::Virtual(VirtualPath::model_program(&id)),
        };
        let processor = match &self.model.processor {
            Some(path) => ResourceLocation::Physical(path.clone()),
            None => ResourceLocation::Virtual(VirtualPath::model_dir(&id)),
        };
        let tokenizer = match &self.model.tokenizer {
            Some(path) => ResourceLocation::Physical(path.clone()),
            None => processor.join("tokenizer.json"),
        };
        ModelResources {
            id,
            program,
            processor,
            tokenizer,
            prompt: self.model.prompt_settings(),
        }
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(model_id) = overrides.model_id.as_ref() {
            self.model.id = model_id.clone();
        }
        if let Some(path) = overrides.program.as_ref() {
            self.model.program = Some(path.clone());
        }
        if let Some(path) = overrides.processor.as_ref() {
            self.model.processor = Some(path.clone());
        }
        if let Some(path) = overrides.tokenizer.as_ref() {
            self.model.tokenizer = Some(path.clone());
        }
        if let Some(template) = overrides.template.as_ref() {
            self.model.template = template.clone();
        }
        if let Some(strategy) = overrides.prompt_strategy {
            self.model.prompt_strategy = strategy;
        }
        if overrides.system_prompt.is_some() {
            self.model.system_prompt = overrides.system_prompt.clone();
        }

        if let Some(max_new_tokens) = overrides.inference.max_new_tokens {
            self.inference.max_new_tokens = max_new_tokens;
        }
        if let Some(temperature) = overrides.inference.temperature {
            self.inference.temperature = temperature;
        }
        if overrides.inference.seed.is_some() {
            self.inference.seed = overrides.inference.seed;
        }

        if let Some(host) = overrides.server.host.as_ref() {
            self.server.host = host.clone();
        }
        if let Some(port) = overrides.server.port {
            self.server.port = port;
        }
        if let Some(max_new_tokens) = overrides.server.max_new_tokens {
            self.server.max_new_tokens = max_new_tokens;
        }
        if let Some(temperature) = overrides.server.temperature {
            self.server.temperature = temperature;
        }
        if !overrides.server.cors_origins.is_empty() {
            self.server.cors_origins = overrides.server.cors_origins.clone();
        }
    }
}

fn validate_temperature(field: &str, value: f64) -> Result<()> {
    ensure!(
        value.is_finite() && value >= 0.0,
        "{field} must be a finite, non-negative number (got {value})"
    );
    Ok(())
}

fn load_virtual_config(fs: &impl VirtualFileSystem) -> Result<(AppConfig, ConfigDescriptor)> {
    let path = VirtualPath::config_file();
    let descriptor = ConfigDescriptor {
        location: ResourceLocation::Virtual(path.clone()),
    };
    if !fs.exists(&path) {
        let mut cfg = AppConfig::default();
        cfg.normalise(fs)?;
        fs.write(&path, &toml::to_string_pretty(&cfg)?)?;
        return Ok((cfg, descriptor));
    }

    let contents = fs.read_to_string(&path)?;
    let mut cfg: AppConfig =
        toml::from_str(&contents).context("failed to parse configuration file")?;
    cfg.normalise(fs)?;
    Ok((cfg, descriptor))
}

fn load_physical_config(
    fs: &impl VirtualFileSystem,
    path: &Path,
) -> Result<(AppConfig, ConfigDescriptor)> {
    let descriptor = ConfigDescriptor {
        location: ResourceLocation::Physical(path.to_path_buf()),
    };
    if !path.exists() {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let mut cfg = AppConfig::default();
        cfg.normalise(fs)?;
        let serialized = toml::to_string_pretty(&cfg)?;
        fs::write(path, serialized)
            .with_context(|| format!("failed to write configuration to {}", path.display()))?;
        return Ok((cfg, descriptor));
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read configuration from {}", path.display()))?;
    let mut cfg: AppConfig = toml::from_str(&contents)
        .with_context(|| format!("failed to parse configuration at {}", path.display()))?;
    cfg.normalise(fs)?;
    Ok((cfg, descriptor))
}

/// Values supplied on the command line; `None` leaves the file's value alone.
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub config_path: Option<PathBuf>,
    pub model_id: Option<String>,
    pub program: Option<PathBuf>,
    pub processor: Option<PathBuf>,
    pub tokenizer: Option<PathBuf>,
    pub template: Option<String>,
    pub prompt_strategy: Option<PromptStrategy>,
    pub system_prompt: Option<String>,
    pub inference: InferenceOverride,
    pub server: ServerOverride,
}

#[derive(Debug, Default, Clone)]
pub struct InferenceOverride {
    pub max_new_tokens: Option<usize>,
    pub temperature: Option<f64>,
    pub seed: Option<u64>,
}

#[derive(Debug, Default, Clone)]
pub struct ServerOverride {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_new_tokens: Option<usize>,
    pub temperature: Option<f64>,
    pub cors_origins: Vec<String>,
}

pub trait ConfigOverride {
    fn apply(self, config: &mut AppConfig);
}

impl ConfigOverride for ConfigOverrides {
    fn apply(self, config: &mut AppConfig) {
        config.apply_overrides(&self);
    }
}

impl ConfigOverride for &ConfigOverrides {
    fn apply(self, config: &mut AppConfig) {
        config.apply_overrides(self);
    }
}

impl<O: ConfigOverride> AddAssign<O> for AppConfig {
    fn add_assign(&mut self, rhs: O) {
        rhs.apply(self);
    }
}

pub fn save_config(
    fs: &impl VirtualFileSystem,
    descriptor: &ConfigDescriptor,
    config: &AppConfig,
) -> Result<()> {
    let serialized = toml::to_string_pretty(config)?;
    match &descriptor.location {
        ResourceLocation::Virtual(path) => fs.write(path, &serialized),
        ResourceLocation::Physical(path) => fs::write(path, serialized)
            .with_context(|| format!("failed to write configuration to {}", path.display())),
    }
}
