use candle_core::{Device, Result, Tensor, D};
use candle_nn::{embedding, layer_norm, Embedding, LayerNorm, Module, VarBuilder};
use serde::{Deserialize, Serialize};

use super::attention::causal_mask;
use super::block::Block;

/// GPT-2 architecture settings, as found in a checkpoint's config.json
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gpt2Config {
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "default_n_embd")]
    pub n_embd: usize,
    #[serde(default = "default_n_layer")]
    pub n_layer: usize,
    #[serde(default = "default_n_head")]
    pub n_head: usize,
    #[serde(default = "default_n_positions")]
    pub n_positions: usize,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    #[serde(default = "default_eos_token_id")]
    pub eos_token_id: u32,
}

fn default_vocab_size() -> usize {
    50257
}
fn default_n_embd() -> usize {
    768
}
fn default_n_layer() -> usize {
    12
}
fn default_n_head() -> usize {
    12
}
fn default_n_positions() -> usize {
    1024
}
fn default_layer_norm_epsilon() -> f64 {
    1e-5
}
fn default_eos_token_id() -> u32 {
    50256
}

impl Default for Gpt2Config {
    /// The 117M "gpt2" checkpoint
    fn default() -> Self {
        Self {
            vocab_size: default_vocab_size(),
            n_embd: default_n_embd(),
            n_layer: default_n_layer(),
            n_head: default_n_head(),
            n_positions: default_n_positions(),
            layer_norm_epsilon: default_layer_norm_epsilon(),
            eos_token_id: default_eos_token_id(),
        }
    }
}

impl Gpt2Config {
    /// Get parameter count in millions
    pub fn param_count_millions(&self) -> f32 {
        let embeddings = self.vocab_size * self.n_embd + self.n_positions * self.n_embd;
        let attention = self.n_layer * (4 * self.n_embd * self.n_embd + 4 * self.n_embd);
        let mlp = self.n_layer * (8 * self.n_embd * self.n_embd + 5 * self.n_embd);
        let layer_norm = self.n_layer * 4 * self.n_embd + 2 * self.n_embd;
        // lm_head shares weights with wte

        let total = embeddings + attention + mlp + layer_norm;
        total as f32 / 1_000_000.0
    }
}

/// Pretrained GPT-2 language model
pub struct Gpt2 {
    wte: Embedding, // token embeddings, also the LM head
    wpe: Embedding, // position embeddings
    h: Vec<Block>,  // transformer blocks
    ln_f: LayerNorm,
    config: Gpt2Config,
    device: Device,
}

impl Gpt2 {
    /// Build the model from a VarBuilder holding GPT-2 weights
    pub fn new(config: &Gpt2Config, vb: VarBuilder) -> Result<Self> {
        // Some checkpoints nest everything under "transformer."
        let vb = if vb.contains_tensor("transformer.wte.weight") {
            vb.pp("transformer")
        } else {
            vb
        };

        let wte = embedding(config.vocab_size, config.n_embd, vb.pp("wte"))?;
        let wpe = embedding(config.n_positions, config.n_embd, vb.pp("wpe"))?;

        let h = (0..config.n_layer)
            .map(|i| {
                Block::new(
                    config.n_embd,
                    config.n_head,
                    config.layer_norm_epsilon,
                    vb.pp(format!("h.{}", i)),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let ln_f = layer_norm(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_f"))?;

        Ok(Self {
            wte,
            wpe,
            h,
            ln_f,
            config: config.clone(),
            device: vb.device().clone(),
        })
    }

    pub fn config(&self) -> &Gpt2Config {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Maximum sequence length the position table covers
    pub fn max_positions(&self) -> usize {
        self.config.n_positions
    }

    fn hidden_states(&self, idx: &Tensor) -> Result<Tensor> {
        let (_b, t) = idx.dims2()?;
        if t == 0 || t > self.config.n_positions {
            candle_core::bail!(
                "Sequence length {} outside 1..={}",
                t,
                self.config.n_positions
            );
        }

        let tok_emb = self.wte.forward(idx)?;
        let pos = Tensor::arange(0u32, t as u32, &self.device)?.unsqueeze(0)?;
        let pos_emb = self.wpe.forward(&pos)?;
        let mut x = tok_emb.broadcast_add(&pos_emb)?;

        let mask = causal_mask(t, &self.device)?;
        for block in &self.h {
            x = block.forward(&x, &mask)?;
        }

        self.ln_f.forward(&x)
    }

    /// Project hidden states onto the vocabulary through the tied embedding matrix
    fn lm_head(&self, x: &Tensor) -> Result<Tensor> {
        x.broadcast_matmul(&self.wte.embeddings().t()?)
    }

    /// Logits for every position, shape `(batch, seq_len, vocab_size)`
    pub fn forward(&self, idx: &Tensor) -> Result<Tensor> {
        let x = self.hidden_states(idx)?;
        self.lm_head(&x)
    }

    /// Logits for the last position only, shape `(batch, vocab_size)`
    pub fn next_token_logits(&self, idx: &Tensor) -> Result<Tensor> {
        let x = self.hidden_states(idx)?;
        let t = x.dim(1)?;
        let last = x.narrow(1, t - 1, 1)?.squeeze(1)?;
        self.lm_head(&last)?.to_dtype(candle_core::DType::F32)?.contiguous()
    }

    /// Log-probabilities for the last position, shape `(batch, vocab_size)`
    pub fn next_token_log_probs(&self, idx: &Tensor) -> Result<Tensor> {
        let logits = self.next_token_logits(idx)?;
        candle_nn::ops::log_softmax(&logits, D::Minus1)
    }
}
