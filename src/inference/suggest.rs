use anyhow::Result;
use candle_core::Tensor;

use super::sampling::{banned_ngram_tokens, logits_processor, mask_tokens, BeamSearch};
use crate::config::{DecodingStrategy, SuggestionSettings};
use crate::model::Gpt2;
use crate::tokenizer::TextTokenizer;

/// Instruction placed in front of the user's text
pub const SUGGESTION_PROMPT: &str = "Complete the sentences keeping the context intact:";

/// Suggestions never repeat a bigram of the prompt or of themselves
const NO_REPEAT_NGRAM_SIZE: usize = 2;

pub fn suggestion_prompt(text: &str) -> String {
    format!("{} {}", SUGGESTION_PROMPT, text)
}

/// Next-token suggester backed by GPT-2
pub struct Suggester {
    model: Gpt2,
    tokenizer: TextTokenizer,
    eos_token_id: u32,
    seed: Option<u64>,
}

impl Suggester {
    pub fn new(model: Gpt2, tokenizer: TextTokenizer) -> Self {
        let eos_token_id = tokenizer
            .token_id("<|endoftext|>")
            .unwrap_or(model.config().eos_token_id);
        Self {
            model,
            tokenizer,
            eos_token_id,
            seed: None,
        }
    }

    /// Fix the sampling seed for reproducible suggestions
    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn model(&self) -> &Gpt2 {
        &self.model
    }

    /// Generate up to `settings.count` distinct continuations of `text`,
    /// each at most `settings.words_per_suggestion` tokens long
    pub fn suggest(&self, text: &str, settings: &SuggestionSettings) -> Result<Vec<String>> {
        let prompt_ids = self.prompt_ids(text, settings.words_per_suggestion)?;
        log::debug!(
            "Suggesting {} x {} tokens ({}) from {} prompt tokens",
            settings.count,
            settings.words_per_suggestion,
            settings.strategy,
            prompt_ids.len()
        );

        let continuations = match settings.strategy {
            DecodingStrategy::Stochastic => {
                self.sample(&prompt_ids, settings.count, settings.words_per_suggestion)?
            }
            DecodingStrategy::Greedy => {
                self.beam_search(&prompt_ids, settings.count, settings.words_per_suggestion)?
            }
        };

        let mut suggestions: Vec<String> = Vec::new();
        for tokens in continuations {
            let suggestion = self.tokenizer.decode(&tokens, true)?;
            if !suggestion.is_empty() && !suggestions.contains(&suggestion) {
                suggestions.push(suggestion);
            }
        }

        Ok(suggestions)
    }

    /// Tokenized prompt, cropped from the left so the new tokens still fit
    fn prompt_ids(&self, text: &str, new_tokens: usize) -> Result<Vec<u32>> {
        let mut ids = self.tokenizer.encode(&suggestion_prompt(text))?;
        let budget = self.model.max_positions().saturating_sub(new_tokens).max(1);
        if ids.len() > budget {
            ids.drain(..ids.len() - budget);
        }
        if ids.is_empty() {
            ids.push(self.eos_token_id);
        }
        Ok(ids)
    }

    fn batch_tensor(&self, rows: &[Vec<u32>]) -> Result<Tensor> {
        let width = rows.first().map(Vec::len).unwrap_or(0);
        let flat: Vec<u32> = rows.iter().flatten().copied().collect();
        Ok(Tensor::from_vec(flat, (rows.len(), width), self.model.device())?)
    }

    /// Nucleus-sample `count` rows side by side in a single batch
    fn sample(&self, prompt: &[u32], count: usize, new_tokens: usize) -> Result<Vec<Vec<u32>>> {
        let mut rows = vec![prompt.to_vec(); count];
        let mut finished = vec![false; count];
        let mut processor = logits_processor(DecodingStrategy::Stochastic, self.seed);

        for _ in 0..new_tokens {
            let logits = self.model.next_token_logits(&self.batch_tensor(&rows)?)?;

            for (r, row) in rows.iter_mut().enumerate() {
                // Finished rows keep padding so the batch stays rectangular
                if finished[r] {
                    row.push(self.eos_token_id);
                    continue;
                }
                let banned = banned_ngram_tokens(row, NO_REPEAT_NGRAM_SIZE);
                let row_logits = mask_tokens(&logits.get(r)?, &banned)?;
                let next = processor.sample(&row_logits)?;
                row.push(next);
                finished[r] = next == self.eos_token_id;
            }

            if finished.iter().all(|&done| done) {
                break;
            }
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                row[prompt.len()..]
                    .iter()
                    .copied()
                    .take_while(|&t| t != self.eos_token_id)
                    .collect()
            })
            .collect())
    }

    /// Beam search with `count` beams, returning every beam
    fn beam_search(
        &self,
        prompt: &[u32],
        count: usize,
        new_tokens: usize,
    ) -> Result<Vec<Vec<u32>>> {
        let mut search = BeamSearch::new(count, self.eos_token_id);

        for _ in 0..new_tokens {
            let rows: Vec<Vec<u32>> = search
                .active()
                .iter()
                .map(|hyp| [prompt, hyp.tokens.as_slice()].concat())
                .collect();

            let log_probs: Vec<Vec<f32>> = self
                .model
                .next_token_log_probs(&self.batch_tensor(&rows)?)?
                .to_vec2()?;
            let banned: Vec<Vec<u32>> = rows
                .iter()
                .map(|row| banned_ngram_tokens(row, NO_REPEAT_NGRAM_SIZE))
                .collect();

            search.step(&log_probs, &banned);
            if search.is_done() {
                break;
            }
        }

        Ok(search.finish().into_iter().map(|hyp| hyp.tokens).collect())
    }
}
