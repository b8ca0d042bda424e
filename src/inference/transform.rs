use anyhow::{anyhow, Result};
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::t5::{self, T5ForConditionalGeneration};
use regex::Regex;
use std::sync::{Mutex, OnceLock};

use super::sampling::logits_processor;
use crate::config::TransformSettings;
use crate::tokenizer::TextTokenizer;

/// Longest encoder input, in tokens
pub const MAX_INPUT_TOKENS: usize = 512;

fn sentence_boundary() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\.\s").expect("valid sentence regex"))
}

fn generated_marker() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)generated.\s?").expect("valid marker regex"))
}

/// Split text into the pieces rewritten one at a time.
///
/// A boundary is a period followed by whitespace; the period is consumed.
pub fn split_sentences(text: &str) -> Vec<&str> {
    sentence_boundary()
        .split(text)
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .collect()
}

/// Remove "Generated:" echoes the model sometimes produces
pub fn clean_output(text: &str) -> String {
    generated_marker().replace_all(text, "").trim().to_string()
}

/// Cap encoder input at `max` tokens, keeping the trailing EOS when present
pub fn fit_input(mut ids: Vec<u32>, max: usize, eos_token_id: u32) -> Vec<u32> {
    if ids.len() > max {
        let ends_with_eos = ids.last() == Some(&eos_token_id);
        ids.truncate(max);
        if ends_with_eos {
            if let Some(last) = ids.last_mut() {
                *last = eos_token_id;
            }
        }
    }
    ids
}

/// Text rewriter backed by a CoEdIT (T5) model
pub struct Transformer {
    // The decoder keeps a KV cache, so generation needs exclusive access
    model: Mutex<T5ForConditionalGeneration>,
    config: t5::Config,
    tokenizer: TextTokenizer,
    device: Device,
    seed: Option<u64>,
}

impl Transformer {
    pub fn new(
        model: T5ForConditionalGeneration,
        config: t5::Config,
        tokenizer: TextTokenizer,
        device: Device,
    ) -> Self {
        Self {
            model: Mutex::new(model),
            config,
            tokenizer,
            device,
            seed: None,
        }
    }

    /// Fix the sampling seed for reproducible rewrites
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    /// Rewrite `text` sentence by sentence for `settings.task`
    pub fn transform(&self, text: &str, settings: &TransformSettings) -> Result<String> {
        let pieces = split_sentences(text);
        if pieces.is_empty() {
            return Ok(String::new());
        }

        log::debug!(
            "Transforming {} sentence(s) with task {} ({})",
            pieces.len(),
            settings.task,
            settings.strategy
        );

        let mut model = self
            .model
            .lock()
            .map_err(|_| anyhow!("T5 model lock poisoned"))?;

        let mut outputs = Vec::with_capacity(pieces.len());
        for piece in pieces {
            let prompt = settings.task.prompt(piece);
            outputs.push(self.rewrite(&mut model, &prompt, settings)?);
        }

        Ok(clean_output(&outputs.join(" ")))
    }

    fn rewrite(
        &self,
        model: &mut T5ForConditionalGeneration,
        prompt: &str,
        settings: &TransformSettings,
    ) -> Result<String> {
        let eos_token_id = self.config.eos_token_id as u32;
        let input_ids = fit_input(self.tokenizer.encode(prompt)?, MAX_INPUT_TOKENS, eos_token_id);
        let input = Tensor::new(input_ids.as_slice(), &self.device)?.unsqueeze(0)?;

        model.clear_kv_cache();
        let encoder_output = model.encode(&input)?;

        let start = self
            .config
            .decoder_start_token_id
            .unwrap_or(self.config.pad_token_id) as u32;
        let mut output_ids = vec![start];
        let mut processor = logits_processor(settings.strategy, self.seed);

        // max_length counts the decoder start token
        for index in 0..settings.max_length.saturating_sub(1) {
            let decoder_ids = if index == 0 || !self.config.use_cache {
                Tensor::new(output_ids.as_slice(), &self.device)?.unsqueeze(0)?
            } else {
                let last = output_ids[output_ids.len() - 1];
                Tensor::new(&[last], &self.device)?.unsqueeze(0)?
            };

            let logits = model
                .decode(&decoder_ids, &encoder_output)?
                .squeeze(0)?
                .to_dtype(DType::F32)?;
            let next = processor.sample(&logits)?;
            if next == eos_token_id {
                break;
            }
            output_ids.push(next);
        }
        model.clear_kv_cache();

        self.tokenizer.decode(&output_ids[1..], true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DecodingStrategy, Task};
    use crate::tokenizer::text::tests::test_tokenizer;
    use candle_nn::{VarBuilder, VarMap};

    const TINY_T5: &str = r#"{
        "vocab_size": 16, "d_model": 8, "d_kv": 4, "d_ff": 16,
        "num_layers": 1, "num_decoder_layers": 1, "num_heads": 2,
        "relative_attention_num_buckets": 8, "relative_attention_max_distance": 16,
        "dropout_rate": 0.0, "layer_norm_epsilon": 1e-6, "initializer_factor": 1.0,
        "feed_forward_proj": "relu", "tie_word_embeddings": true,
        "is_decoder": false, "is_encoder_decoder": true, "use_cache": true,
        "pad_token_id": 0, "eos_token_id": 1, "decoder_start_token_id": 0
    }"#;

    fn tiny_transformer(varmap: &VarMap) -> Transformer {
        let config: t5::Config = serde_json::from_str(TINY_T5).unwrap();
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        let model = T5ForConditionalGeneration::load(vb, &config).unwrap();
        Transformer::new(model, config, test_tokenizer(), Device::Cpu).with_seed(Some(3))
    }

    #[test]
    fn test_split_sentences() {
        assert_eq!(
            split_sentences("Talk like Yoda I will. Very wise he was. Strong he was."),
            vec!["Talk like Yoda I will", "Very wise he was", "Strong he was."]
        );
        assert_eq!(split_sentences("No boundary here"), vec!["No boundary here"]);
        assert_eq!(split_sentences("Version 1.5 works"), vec!["Version 1.5 works"]);
        assert!(split_sentences("   ").is_empty());
        assert!(split_sentences(". \n").is_empty());
    }

    #[test]
    fn test_clean_output() {
        assert_eq!(clean_output("Generated: Fixed text."), "Fixed text.");
        assert_eq!(clean_output("generated:Fixed"), "Fixed");
        assert_eq!(clean_output("  plain text "), "plain text");
    }

    #[test]
    fn test_fit_input() {
        assert_eq!(fit_input(vec![5, 6, 1], 4, 1), vec![5, 6, 1]);
        assert_eq!(fit_input(vec![5, 6, 7, 8, 1], 3, 1), vec![5, 6, 1]);
        assert_eq!(fit_input(vec![5, 6, 7, 8], 3, 1), vec![5, 6, 7]);
    }

    #[test]
    fn test_blank_input_skips_model() {
        let varmap = VarMap::new();
        let transformer = tiny_transformer(&varmap);
        let out = transformer.transform("  ", &TransformSettings::default()).unwrap();
        assert_eq!(out, "");
    }

    #[test]
    fn test_transform_runs_decoder() {
        let varmap = VarMap::new();
        let transformer = tiny_transformer(&varmap);
        let settings = TransformSettings {
            task: Task::Grammar,
            strategy: DecodingStrategy::Greedy,
            max_length: 50,
        };

        let first = transformer.transform("the force. strong is", &settings).unwrap();
        let second = transformer.transform("the force. strong is", &settings).unwrap();
        assert_eq!(first, second);
        // at most 49 tokens per sentence, joined by one space
        assert!(first.split_whitespace().count() <= 2 * 49);
    }
}
