use candle_core::{Result, Tensor, D};
use candle_nn::{init::Init, ops, Linear, Module, VarBuilder};

/// Load a Hugging Face `Conv1D` layer as a candle `Linear`.
///
/// GPT-2 checkpoints store these weights as `[in, out]`, the transpose of
/// what `Linear` expects.
pub(super) fn conv1d(n_in: usize, n_out: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get_with_hints(
        (n_in, n_out),
        "weight",
        Init::Randn {
            mean: 0.0,
            stdev: 0.02,
        },
    )?;
    let bias = vb.get_with_hints(n_out, "bias", Init::Const(0.0))?;
    Ok(Linear::new(weight.t()?.contiguous()?, Some(bias)))
}

/// Causal self-attention layer
pub struct CausalSelfAttention {
    c_attn: Linear,
    c_proj: Linear,
    n_head: usize,
    n_embd: usize,
}

impl CausalSelfAttention {
    pub fn new(n_embd: usize, n_head: usize, vb: VarBuilder) -> Result<Self> {
        if n_embd % n_head != 0 {
            candle_core::bail!("n_embd ({}) must be divisible by n_head ({})", n_embd, n_head);
        }

        let c_attn = conv1d(n_embd, 3 * n_embd, vb.pp("c_attn"))?;
        let c_proj = conv1d(n_embd, n_embd, vb.pp("c_proj"))?;

        Ok(Self {
            c_attn,
            c_proj,
            n_head,
            n_embd,
        })
    }

    /// `mask` is a `(t, t)` u8 tensor with 1 where attention is allowed
    pub fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (b, t, c) = x.dims3()?;
        let head_dim = self.n_embd / self.n_head;

        // Calculate query, key, values for all heads in batch
        let qkv = self.c_attn.forward(x)?;
        let qkv = qkv.reshape((b, t, 3, self.n_head, head_dim))?;

        // (B, num_heads, T, head_dim)
        let q = qkv.narrow(2, 0, 1)?.squeeze(2)?.transpose(1, 2)?.contiguous()?;
        let k = qkv.narrow(2, 1, 1)?.squeeze(2)?.transpose(1, 2)?.contiguous()?;
        let v = qkv.narrow(2, 2, 1)?.squeeze(2)?.transpose(1, 2)?.contiguous()?;

        // Attention scores
        let scale = 1.0 / (head_dim as f64).sqrt();
        let k_t = k.transpose(D::Minus2, D::Minus1)?.contiguous()?;
        let att = (q.matmul(&k_t)? * scale)?;

        // Apply causal mask
        let mask = mask.broadcast_as(att.shape())?;
        let neg_inf = Tensor::new(f32::NEG_INFINITY, att.device())?.broadcast_as(att.shape())?;
        let att = mask.where_cond(&att, &neg_inf)?;

        let att = ops::softmax_last_dim(&att)?;

        // Attention output
        let y = att.matmul(&v)?;
        let y = y.transpose(1, 2)?.contiguous()?.reshape((b, t, c))?;

        self.c_proj.forward(&y)
    }
}

/// Lower-triangular mask for a sequence of length `t`
pub fn causal_mask(t: usize, device: &candle_core::Device) -> Result<Tensor> {
    let mask: Vec<u8> = (0..t)
        .flat_map(|i| (0..t).map(move |j| u8::from(j <= i)))
        .collect();
    Tensor::from_vec(mask, (t, t), device)
}
