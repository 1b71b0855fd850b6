use std::path::PathBuf;

use clap::Parser;
use gemma_vlm_config::{AppConfig, ConfigOverride, ConfigOverrides};
use gemma_vlm_core::PromptStrategy;

#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Gemma vision-language API server", long_about = None)]
pub struct ServerArgs {
    /// Optional path to a configuration file (defaults to platform config dir).
    #[arg(long, value_name = "PATH", help_heading = "Application")]
    pub config: Option<PathBuf>,

    /// Model id; also names the directory under the models root.
    #[arg(long, value_name = "ID", help_heading = "Model")]
    pub model: Option<String>,

    /// Exported program (.pte) with the three inference methods.
    #[arg(long, value_name = "PATH", help_heading = "Model")]
    pub program: Option<PathBuf>,

    /// Processor directory (tokenizer.json and friends).
    #[arg(long, value_name = "PATH", help_heading = "Model")]
    pub processor: Option<PathBuf>,

    #[arg(long, value_name = "PATH", help_heading = "Model")]
    pub tokenizer: Option<PathBuf>,

    /// Conversation template name (gemma3, plain).
    #[arg(long, help_heading = "Prompt")]
    pub template: Option<String>,

    /// auto, chat_template or manual.
    #[arg(long, value_parser = parse_prompt_strategy, help_heading = "Prompt")]
    pub prompt_strategy: Option<PromptStrategy>,

    #[arg(long, help_heading = "Prompt")]
    pub system_prompt: Option<String>,

    /// Default token budget for requests that omit one.
    #[arg(long, help_heading = "Inference")]
    pub max_new_tokens: Option<usize>,

    /// Default temperature for requests that omit one (0 = greedy).
    #[arg(long, help_heading = "Inference")]
    pub temperature: Option<f64>,

    /// RNG seed for sampling.
    #[arg(long, help_heading = "Inference")]
    pub seed: Option<u64>,

    /// Host/IP for Rocket to bind to.
    #[arg(long, help_heading = "Application")]
    pub host: Option<String>,

    /// TCP port for Rocket.
    #[arg(long, help_heading = "Application")]
    pub port: Option<u16>,

    /// Allowed CORS origin; repeat to allow several.
    #[arg(long = "cors-origin", value_name = "ORIGIN", help_heading = "Application")]
    pub cors_origins: Vec<String>,
}

fn parse_prompt_strategy(value: &str) -> Result<PromptStrategy, String> {
    match value.to_ascii_lowercase().replace('-', "_").as_str() {
        "auto" => Ok(PromptStrategy::Auto),
        "chat_template" => Ok(PromptStrategy::ChatTemplate),
        "manual" => Ok(PromptStrategy::Manual),
        other => Err(format!(
            "unknown prompt strategy `{other}` (expected auto, chat_template or manual)"
        )),
    }
}

impl From<&ServerArgs> for ConfigOverrides {
    fn from(args: &ServerArgs) -> Self {
        let mut overrides = ConfigOverrides {
            config_path: args.config.clone(),
            model_id: args.model.clone(),
            program: args.program.clone(),
            processor: args.processor.clone(),
            tokenizer: args.tokenizer.clone(),
            template: args.template.clone(),
            prompt_strategy: args.prompt_strategy,
            system_prompt: args.system_prompt.clone(),
            ..ConfigOverrides::default()
        };
        overrides.inference.seed = args.seed;
        overrides.server.host = args.host.clone();
        overrides.server.port = args.port;
        overrides.server.max_new_tokens = args.max_new_tokens;
        overrides.server.temperature = args.temperature;
        overrides.server.cors_origins = args.cors_origins.clone();
        overrides
    }
}

impl ConfigOverride for &ServerArgs {
    fn apply(self, config: &mut AppConfig) {
        config.apply_overrides(&ConfigOverrides::from(self));
    }
}
