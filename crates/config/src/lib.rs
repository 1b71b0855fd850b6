pub mod config;
pub mod fs;

pub use config::{
    AppConfig, ConfigDescriptor, ConfigOverride, ConfigOverrides, InferenceOverride,
    InferenceSettings, ModelResources, ModelSettings, ResourceLocation, ServerOverride,
    ServerSettings, save_config,
};
pub use fs::{LocalFileSystem, Namespace, VirtualFileSystem, VirtualPath};
