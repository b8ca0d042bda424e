use anyhow::Context;
use candle_core::Device;

use crate::config::{AppConfig, SuggestionSettings, TransformSettings};
use crate::inference::{Suggester, Transformer};
use crate::io::{load_gpt2, load_t5, HubClient};
use crate::{AssistantError, Result};

/// The two model calls the UI is built around
pub trait Assistant: Send + Sync {
    /// Continuations of `text` proposed by the generator
    fn suggest(&self, text: &str, settings: &SuggestionSettings) -> Result<Vec<String>>;

    /// `text` rewritten by the correction model
    fn transform(&self, text: &str, settings: &TransformSettings) -> Result<String>;

    fn transform_available(&self) -> bool;

    /// Human-readable compute device, e.g. "cuda" or "cpu"
    fn device_label(&self) -> String;
}

fn model_error(err: anyhow::Error) -> AssistantError {
    AssistantError::Model(format!("{:#}", err))
}

pub fn device_label(device: &Device) -> String {
    match device {
        Device::Cpu => "cpu".to_string(),
        Device::Cuda(_) => "cuda".to_string(),
        Device::Metal(_) => "metal".to_string(),
    }
}

/// Assistant running the pretrained GPT-2 and CoEdIT models in-process
pub struct WritingAssistant {
    suggester: Suggester,
    transformer: Option<Transformer>,
    device: Device,
}

impl WritingAssistant {
    pub fn new(suggester: Suggester, transformer: Option<Transformer>, device: Device) -> Self {
        Self {
            suggester,
            transformer,
            device,
        }
    }

    /// Fetch (or reuse cached) weights and load both models
    pub async fn load(config: &mut AppConfig) -> anyhow::Result<Self> {
        let device = config
            .init_device()
            .context("Failed to initialize compute device")?
            .clone();
        log::info!("Using device: {}", device_label(&device));

        let hub = HubClient::new(&config.cache_dir)?;

        let files = hub
            .resolve(&config.generator)
            .await
            .context("Failed to fetch the suggestion model")?;
        let (model, tokenizer) = load_gpt2(&files, &device)?;
        let suggester = Suggester::new(model, tokenizer).with_seed(config.seed);

        let transformer = if config.transform_enabled(&device) {
            let files = hub
                .resolve(&config.corrector)
                .await
                .context("Failed to fetch the correction model")?;
            let (model, t5_config, tokenizer) = load_t5(&files, &device)?;
            let transformer = Transformer::new(model, t5_config, tokenizer, device.clone());
            Some(transformer.with_seed(config.seed))
        } else {
            log::warn!(
                "No GPU found: text transformation disabled (use --cpu-transform to force it)"
            );
            None
        };

        Ok(Self::new(suggester, transformer, device))
    }
}

impl Assistant for WritingAssistant {
    fn suggest(&self, text: &str, settings: &SuggestionSettings) -> Result<Vec<String>> {
        settings.validate()?;
        self.suggester.suggest(text, settings).map_err(model_error)
    }

    fn transform(&self, text: &str, settings: &TransformSettings) -> Result<String> {
        settings.validate()?;
        let transformer = self
            .transformer
            .as_ref()
            .ok_or(AssistantError::TransformUnavailable)?;
        transformer.transform(text, settings).map_err(model_error)
    }

    fn transform_available(&self) -> bool {
        self.transformer.is_some()
    }

    fn device_label(&self) -> String {
        device_label(&self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::gpt::tests::tiny_model;
    use crate::tokenizer::text::tests::test_tokenizer;
    use candle_nn::VarMap;

    fn assistant(varmap: &VarMap) -> WritingAssistant {
        let suggester = Suggester::new(tiny_model(varmap), test_tokenizer()).with_seed(Some(1));
        WritingAssistant::new(suggester, None, Device::Cpu)
    }

    #[test]
    fn test_transform_unavailable_without_model() {
        let varmap = VarMap::new();
        let assistant = assistant(&varmap);
        assert!(!assistant.transform_available());
        assert_eq!(assistant.device_label(), "cpu");
        assert!(matches!(
            assistant.transform("the force", &TransformSettings::default()),
            Err(AssistantError::TransformUnavailable)
        ));
    }

    #[test]
    fn test_settings_validated_before_inference() {
        let varmap = VarMap::new();
        let assistant = assistant(&varmap);

        let bad = SuggestionSettings {
            count: 0,
            ..Default::default()
        };
        assert!(matches!(
            assistant.suggest("the force", &bad),
            Err(AssistantError::InvalidSettings(_))
        ));

        let bad = TransformSettings {
            max_length: 10,
            ..Default::default()
        };
        assert!(matches!(
            assistant.transform("the force", &bad),
            Err(AssistantError::InvalidSettings(_))
        ));
    }

    #[test]
    fn test_suggest_through_assistant() {
        let varmap = VarMap::new();
        let assistant = assistant(&varmap);
        let suggestions = assistant
            .suggest("the force", &SuggestionSettings::default())
            .unwrap();
        assert!(suggestions.len() <= 5);
    }
}
