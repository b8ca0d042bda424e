use candle_core::{Result, Tensor};
use candle_transformers::generation::LogitsProcessor;
use std::collections::HashSet;

use crate::config::{DecodingStrategy, TOP_P};

/// Tokens that would repeat an n-gram already present in `seq`.
///
/// Mirrors the `no_repeat_ngram_size` rule: the last `n - 1` tokens form a
/// prefix, and every token that followed that prefix earlier is banned.
pub fn banned_ngram_tokens(seq: &[u32], n: usize) -> Vec<u32> {
    if n == 0 || seq.len() + 1 < n {
        return Vec::new();
    }
    if n == 1 {
        let unique: HashSet<u32> = seq.iter().copied().collect();
        return unique.into_iter().collect();
    }

    let prefix = &seq[seq.len() - (n - 1)..];
    let mut banned = Vec::new();
    for window in seq.windows(n) {
        let (head, next) = window.split_at(n - 1);
        if head == prefix && !banned.contains(&next[0]) {
            banned.push(next[0]);
        }
    }
    banned
}

/// Set the logits of `banned` tokens to -inf in a 1-D logits tensor
pub fn mask_tokens(logits: &Tensor, banned: &[u32]) -> Result<Tensor> {
    if banned.is_empty() {
        return Ok(logits.clone());
    }

    let mut values: Vec<f32> = logits.to_vec1()?;
    for &token in banned {
        if let Some(v) = values.get_mut(token as usize) {
            *v = f32::NEG_INFINITY;
        }
    }
    Tensor::new(values.as_slice(), logits.device())
}

/// Token chooser for a decoding strategy: nucleus sampling or argmax
pub fn logits_processor(strategy: DecodingStrategy, seed: Option<u64>) -> LogitsProcessor {
    let seed = seed.unwrap_or_else(rand::random);
    match strategy {
        DecodingStrategy::Stochastic => LogitsProcessor::new(seed, Some(1.0), Some(TOP_P)),
        DecodingStrategy::Greedy => LogitsProcessor::new(seed, None, None),
    }
}

/// One candidate continuation kept by beam search
#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    /// Generated tokens, EOS excluded
    pub tokens: Vec<u32>,
    /// Sum of token log-probabilities
    pub score: f32,
}

impl Hypothesis {
    /// Length-normalized score used for the final ranking
    pub fn normalized_score(&self) -> f32 {
        self.score / self.tokens.len().max(1) as f32
    }
}

/// Beam search over externally computed log-probabilities
pub struct BeamSearch {
    width: usize,
    eos_token_id: u32,
    active: Vec<Hypothesis>,
    finished: Vec<Hypothesis>,
}

impl BeamSearch {
    pub fn new(width: usize, eos_token_id: u32) -> Self {
        Self {
            width: width.max(1),
            eos_token_id,
            active: vec![Hypothesis {
                tokens: Vec::new(),
                score: 0.0,
            }],
            finished: Vec::new(),
        }
    }

    /// Hypotheses still being extended, in the order `step` expects its rows
    pub fn active(&self) -> &[Hypothesis] {
        &self.active
    }

    pub fn is_done(&self) -> bool {
        self.active.is_empty() || self.finished.len() >= self.width
    }

    /// Extend every active hypothesis by one token.
    ///
    /// `log_probs[i]` and `banned[i]` belong to `active()[i]`.
    pub fn step(&mut self, log_probs: &[Vec<f32>], banned: &[Vec<u32>]) {
        let per_row = 2 * self.width;
        let mut candidates: Vec<(f32, usize, u32)> = Vec::new();

        for (row, hyp) in self.active.iter().enumerate() {
            let Some(row_log_probs) = log_probs.get(row) else {
                continue;
            };
            let row_banned = banned.get(row).map(Vec::as_slice).unwrap_or(&[]);

            let mut scored: Vec<(f32, u32)> = row_log_probs
                .iter()
                .enumerate()
                .filter(|(token, lp)| lp.is_finite() && !row_banned.contains(&(*token as u32)))
                .map(|(token, lp)| (hyp.score + lp, token as u32))
                .collect();

            if scored.len() > per_row {
                scored.select_nth_unstable_by(per_row - 1, |a, b| b.0.total_cmp(&a.0));
                scored.truncate(per_row);
            }
            candidates.extend(scored.into_iter().map(|(score, token)| (score, row, token)));
        }

        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut next = Vec::with_capacity(self.width);
        for (score, row, token) in candidates {
            if next.len() >= self.width {
                break;
            }
            let tokens = self.active[row].tokens.clone();
            if token == self.eos_token_id {
                if self.finished.len() < self.width {
                    self.finished.push(Hypothesis { tokens, score });
                }
            } else {
                let mut tokens = tokens;
                tokens.push(token);
                next.push(Hypothesis { tokens, score });
            }
        }

        self.active = next;
    }

    /// Best `width` hypotheses, finished and unfinished, best first
    pub fn finish(self) -> Vec<Hypothesis> {
        let mut all = self.finished;
        all.extend(self.active);
        all.sort_by(|a, b| b.normalized_score().total_cmp(&a.normalized_score()));
        all.truncate(self.width);
        all
    }
}
