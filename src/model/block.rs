use candle_core::{Result, Tensor};
use candle_nn::{layer_norm, LayerNorm, Linear, Module, VarBuilder};

use super::attention::{conv1d, CausalSelfAttention};

/// MLP (Multi-Layer Perceptron) module
pub struct MLP {
    c_fc: Linear,
    c_proj: Linear,
}

impl MLP {
    pub fn new(n_embd: usize, vb: VarBuilder) -> Result<Self> {
        let c_fc = conv1d(n_embd, 4 * n_embd, vb.pp("c_fc"))?;
        let c_proj = conv1d(4 * n_embd, n_embd, vb.pp("c_proj"))?;

        Ok(Self { c_fc, c_proj })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // tanh approximation, matching GPT-2's gelu_new
        let x = self.c_fc.forward(x)?.gelu()?;
        self.c_proj.forward(&x)
    }
}

/// Transformer block
pub struct Block {
    ln_1: LayerNorm,
    attn: CausalSelfAttention,
    ln_2: LayerNorm,
    mlp: MLP,
}

impl Block {
    pub fn new(
        n_embd: usize,
        n_head: usize,
        layer_norm_epsilon: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        let ln_1 = layer_norm(n_embd, layer_norm_epsilon, vb.pp("ln_1"))?;
        let attn = CausalSelfAttention::new(n_embd, n_head, vb.pp("attn"))?;
        let ln_2 = layer_norm(n_embd, layer_norm_epsilon, vb.pp("ln_2"))?;
        let mlp = MLP::new(n_embd, vb.pp("mlp"))?;

        Ok(Self {
            ln_1,
            attn,
            ln_2,
            mlp,
        })
    }

    pub fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        // Attention block with residual connection
        let attn_out = self.attn.forward(&self.ln_1.forward(x)?, mask)?;
        let x = (x + attn_out)?;

        // MLP block with residual connection
        let mlp_out = self.mlp.forward(&self.ln_2.forward(&x)?)?;
        x + mlp_out
    }
}
