use std::path::Path;
use tokenizers::Tokenizer;
use tokenizers::{TruncationDirection, TruncationParams, TruncationStrategy};

use crate::errors::{LoadError, Result};
use crate::hub::HubClient;

/// Repositories with a `tokenizer.json` for each text encoder family
pub const CLIP_L_TOKENIZER_REPO: &str = "openai/clip-vit-large-patch14";
pub const CLIP_G_TOKENIZER_REPO: &str = "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k";
pub const T5_TOKENIZER_REPO: &str = "google/t5-v1_1-xxl";

/// Unified tokenizer loader with common download logic
pub struct TokenizerLoader;

impl TokenizerLoader {
    /// Load tokenizer from a local file path
    pub fn from_file(path: &Path) -> Result<Tokenizer> {
        if !path.is_file() {
            return Err(LoadError::NotFound(path.to_path_buf()));
        }
        Tokenizer::from_file(path).map_err(|e| {
            LoadError::Tokenizer(format!("Failed to load tokenizer from {}: {}", path.display(), e))
        })
    }

    /// Load `<subfolder>/tokenizer.json` of `repo_id`. Diffusers repos often
    /// ship only `vocab.json`/`merges.txt` or a sentencepiece model, in which
    /// case `tokenizer.json` is taken from the `fallback` repository.
    pub fn from_hub(
        hub: &HubClient,
        repo_id: &str,
        subfolder: &str,
        fallback: Option<&str>,
    ) -> Result<Tokenizer> {
        match hub.get(repo_id, Some(subfolder), "tokenizer.json") {
            Ok(path) => Self::from_file(&path),
            Err(err) => {
                let fallback = fallback.ok_or(err)?;
                tracing::debug!(repo = repo_id, subfolder, fallback, "tokenizer.json missing, using fallback");
                let path = hub.get(fallback, None, "tokenizer.json")?;
                Self::from_file(&path)
            }
        }
    }

    /// Like [`Self::from_hub`], preferring a local diffusers directory.
    pub fn from_local_or_hub(
        hub: &HubClient,
        local_root: Option<&Path>,
        repo_id: &str,
        subfolder: &str,
        fallback: Option<&str>,
    ) -> Result<Tokenizer> {
        if let Some(root) = local_root {
            let path = root.join(subfolder).join("tokenizer.json");
            if path.is_file() {
                return Self::from_file(&path);
            }
        }
        Self::from_hub(hub, repo_id, subfolder, fallback)
    }

    /// Configure tokenizer with truncation
    pub fn with_truncation(mut tokenizer: Tokenizer, max_length: usize) -> Result<Tokenizer> {
        tokenizer.with_truncation(Some(TruncationParams {
            max_length,
            strategy: TruncationStrategy::LongestFirst,
            stride: 0,
            direction: TruncationDirection::Right,
        }))?;
        Ok(tokenizer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokenizers::models::wordlevel::WordLevel;

    fn word_level() -> Tokenizer {
        let vocab = [("hello".to_string(), 0u32), ("[UNK]".to_string(), 1)]
            .into_iter()
            .collect();
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("[UNK]".to_string())
            .build()
            .unwrap();
        Tokenizer::new(model)
    }

    #[test]
    fn test_from_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer.json");
        word_level().save(&path, false).unwrap();

        let tokenizer = TokenizerLoader::from_file(&path).unwrap();
        let tokenizer = TokenizerLoader::with_truncation(tokenizer, 77).unwrap();
        assert_eq!(tokenizer.get_truncation().map(|t| t.max_length), Some(77));

        let missing = TokenizerLoader::from_file(&dir.path().join("nope.json"));
        assert!(matches!(missing, Err(LoadError::NotFound(_))));
    }
}
