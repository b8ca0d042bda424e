use anyhow::{anyhow, Result};
use std::path::Path;
use std::str::FromStr;
use tokenizers::tokenizer::Tokenizer;

/// Hugging Face tokenizer wrapper shared by both models
#[derive(Clone)]
pub struct TextTokenizer {
    tokenizer: Tokenizer,
    vocab_size: usize,
}

impl TextTokenizer {
    fn from_tokenizer(tokenizer: Tokenizer) -> Self {
        let vocab_size = tokenizer.get_vocab_size(true);
        Self {
            tokenizer,
            vocab_size,
        }
    }

    /// Load a tokenizer.json file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| anyhow!("Failed to load tokenizer from {}: {}", path.display(), e))?;
        Ok(Self::from_tokenizer(tokenizer))
    }

    /// Load from an in-memory tokenizer.json document
    pub fn from_json(json: &str) -> Result<Self> {
        let tokenizer = Tokenizer::from_str(json)
            .map_err(|e| anyhow!("Failed to parse tokenizer definition: {}", e))?;
        Ok(Self::from_tokenizer(tokenizer))
    }

    /// Encode text to token ids
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!("Failed to encode text: {}", e))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Decode token ids to text
    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(|e| anyhow!("Failed to decode tokens: {}", e))
    }

    /// Get vocabulary size
    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Look up a token id, e.g. "<|endoftext|>"
    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.tokenizer.token_to_id(token)
    }
}
