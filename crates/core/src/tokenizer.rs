use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, anyhow};
use tokenizers::Tokenizer;
use tracing::info;

/// The slice of tokenizer behaviour the runtime depends on.
pub trait TextTokenizer: Send + Sync {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>>;
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;
    fn token_to_id(&self, token: &str) -> Option<u32>;
}

impl TextTokenizer for Tokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = (**self)
            .encode(text, add_special_tokens)
            .map_err(|err| anyhow!("tokenization failed: {err}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        (**self)
            .decode(ids, skip_special_tokens)
            .map_err(|err| anyhow!("detokenization failed: {err}"))
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        (**self).token_to_id(token)
    }
}

impl<T: TextTokenizer + ?Sized> TextTokenizer for Arc<T> {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        (**self).encode(text, add_special_tokens)
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        (**self).decode(ids, skip_special_tokens)
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        (**self).token_to_id(token)
    }
}

/// Loads `tokenizer.json` from a file path or a processor directory.
pub fn load_tokenizer(path: &Path) -> Result<Tokenizer> {
    let file = resolve_tokenizer_file(path);
    let tokenizer = Tokenizer::from_file(&file)
        .map_err(|err| anyhow!("failed to load tokenizer: {err}"))
        .with_context(|| format!("tokenizer path {}", file.display()))?;
    info!(
        path = %file.display(),
        vocab = tokenizer.get_vocab_size(true),
        "Loaded tokenizer"
    );
    Ok(tokenizer)
}

fn resolve_tokenizer_file(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.join("tokenizer.json")
    } else {
        path.to_path_buf()
    }
}
