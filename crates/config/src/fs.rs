//! On-disk layout. The config root holds `config.toml`; the models root holds
//! one directory per model id with the exported `model.pte` and the processor
//! files (`tokenizer.json`, ...) next to it.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};

pub const CONFIG_DIR_ENV: &str = "GEMMA_VLM_CONFIG_DIR";
pub const MODELS_DIR_ENV: &str = "GEMMA_VLM_MODELS_DIR";

const CONFIG_FILE: &str = "config.toml";
const PROGRAM_FILE: &str = "model.pte";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Namespace {
    Config,
    Models,
}

/// A path relative to one of the roots, resolved by a [`VirtualFileSystem`].
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct VirtualPath {
    namespace: Namespace,
    relative: PathBuf,
}

impl VirtualPath {
    pub fn config_file() -> Self {
        Self {
            namespace: Namespace::Config,
            relative: PathBuf::from(CONFIG_FILE),
        }
    }

    /// Processor directory of a model; the program sits inside it.
    pub fn model_dir(model_id: impl AsRef<str>) -> Self {
        Self {
            namespace: Namespace::Models,
            relative: PathBuf::from(model_id.as_ref()),
        }
    }

    pub fn model_program(model_id: impl AsRef<str>) -> Self {
        Self::model_dir(model_id).join(PROGRAM_FILE)
    }

    pub fn join(&self, segment: impl AsRef<Path>) -> Self {
        Self {
            namespace: self.namespace,
            relative: self.relative.join(segment),
        }
    }

    pub fn namespace(&self) -> Namespace {
        self.namespace
    }
}

/// Maps virtual paths onto real files. Only [`locate`](Self::locate) is
/// required; the I/O helpers go through it.
pub trait VirtualFileSystem {
    fn locate(&self, path: &VirtualPath) -> PathBuf;

    fn exists(&self, path: &VirtualPath) -> bool {
        self.locate(path).exists()
    }

    fn read_to_string(&self, path: &VirtualPath) -> Result<String> {
        let physical = self.locate(path);
        fs::read_to_string(&physical)
            .with_context(|| format!("failed to read {}", physical.display()))
    }

    /// Writes `contents`, creating parent directories first.
    fn write(&self, path: &VirtualPath, contents: &str) -> Result<()> {
        let physical = self.locate(path);
        if let Some(parent) = physical.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        fs::write(&physical, contents)
            .with_context(|| format!("failed to write {}", physical.display()))
    }

    fn ensure_dir(&self, path: &VirtualPath) -> Result<()> {
        let physical = self.locate(path);
        fs::create_dir_all(&physical)
            .with_context(|| format!("failed to create directory {}", physical.display()))
    }
}

#[derive(Debug, Clone)]
pub struct LocalFileSystem {
    config_root: PathBuf,
    models_root: PathBuf,
}

impl LocalFileSystem {
    /// Roots from the environment, else the platform config and data dirs
    /// under `app_name`.
    pub fn new(app_name: &str) -> Self {
        let config_root = env::var_os(CONFIG_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| platform_dir(dirs::config_dir(), ".config", app_name));
        let models_root = env::var_os(MODELS_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                platform_dir(dirs::data_dir(), ".local/share", app_name).join("models")
            });
        Self::with_directories(config_root, models_root)
    }

    pub fn with_directories(config_root: PathBuf, models_root: PathBuf) -> Self {
        Self {
            config_root,
            models_root,
        }
    }

    pub fn models_root(&self) -> &Path {
        &self.models_root
    }
}

impl VirtualFileSystem for LocalFileSystem {
    fn locate(&self, path: &VirtualPath) -> PathBuf {
        let root = match path.namespace {
            Namespace::Config => &self.config_root,
            Namespace::Models => &self.models_root,
        };
        root.join(&path.relative)
    }
}

fn platform_dir(base: Option<PathBuf>, home_fallback: &str, app_name: &str) -> PathBuf {
    base.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(home_fallback)
    })
    .join(app_name)
}
