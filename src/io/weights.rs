use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use candle_transformers::models::t5;
use serde::de::DeserializeOwned;
use std::fs;
use std::path::Path;

use super::hub::ModelFiles;
use crate::model::{Gpt2, Gpt2Config};
use crate::tokenizer::TextTokenizer;

/// Read and parse a JSON model configuration
pub fn read_config<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let path = path.as_ref();
    let json = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse config JSON: {}", path.display()))
}

/// Memory-map a safetensors file into a VarBuilder
pub fn mmap_var_builder<P: AsRef<Path>>(path: P, device: &Device) -> Result<VarBuilder<'static>> {
    let path = path.as_ref();
    // SAFETY: the weights file is not modified while the process runs
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, device) }
        .with_context(|| format!("Failed to map model weights: {}", path.display()))?;
    Ok(vb)
}

/// Load the GPT-2 suggestion model and its tokenizer
pub fn load_gpt2(files: &ModelFiles, device: &Device) -> Result<(Gpt2, TextTokenizer)> {
    let config: Gpt2Config = read_config(&files.config)?;
    let vb = mmap_var_builder(&files.weights, device)?;
    let model = Gpt2::new(&config, vb).context("Failed to build GPT-2 model")?;
    let tokenizer =
        TextTokenizer::from_file(&files.tokenizer).context("Failed to load GPT-2 tokenizer")?;

    log::info!(
        "GPT-2 loaded: {} layers, {:.1}M parameters",
        config.n_layer,
        config.param_count_millions()
    );
    Ok((model, tokenizer))
}

/// Load the T5 correction model, its config and tokenizer
pub fn load_t5(
    files: &ModelFiles,
    device: &Device,
) -> Result<(t5::T5ForConditionalGeneration, t5::Config, TextTokenizer)> {
    let config: t5::Config = read_config(&files.config)?;
    let vb = mmap_var_builder(&files.weights, device)?;
    let model =
        t5::T5ForConditionalGeneration::load(vb, &config).context("Failed to build T5 model")?;
    let tokenizer =
        TextTokenizer::from_file(&files.tokenizer).context("Failed to load T5 tokenizer")?;

    log::info!("T5 loaded: {} layers, d_model {}", config.num_layers, config.d_model);
    Ok((model, config, tokenizer))
}
