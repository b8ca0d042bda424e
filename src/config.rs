use candle_core::{Device, Result as CandleResult};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::{AssistantError, Result};

/// Text shown in the editor when a session starts
pub const DEFAULT_TEXT: &str =
    "Talk like Yoda I will. Very wise he was. Strong with the force he was.";

/// Allowed number of suggestions per request
pub const SUGGESTION_COUNT_RANGE: RangeInclusive<usize> = 1..=10;

/// Allowed number of generated tokens per suggestion
pub const WORDS_PER_SUGGESTION_RANGE: RangeInclusive<usize> = 1..=10;

/// Allowed output length for text transformation
pub const MAX_LENGTH_RANGE: RangeInclusive<usize> = 50..=500;

/// Nucleus sampling threshold used by the stochastic strategy
pub const TOP_P: f64 = 0.95;

/// Decoding strategy for both models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DecodingStrategy {
    #[default]
    Stochastic, // nucleus sampling
    Greedy,
}

impl DecodingStrategy {
    pub const ALL: [DecodingStrategy; 2] = [DecodingStrategy::Stochastic, DecodingStrategy::Greedy];
}

impl FromStr for DecodingStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stochastic" | "s" => Ok(DecodingStrategy::Stochastic),
            "greedy" | "g" => Ok(DecodingStrategy::Greedy),
            _ => Err(format!("Invalid decoding strategy: {}. Use stochastic or greedy", s)),
        }
    }
}

impl std::fmt::Display for DecodingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodingStrategy::Stochastic => write!(f, "stochastic"),
            DecodingStrategy::Greedy => write!(f, "greedy"),
        }
    }
}

/// Rewrite task (tone) for the correction model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Task {
    Paraphrase,
    Coherent,
    Simpler,
    #[default]
    Grammar,
    Formal,
    Neutral,
}

impl Task {
    /// Tasks in the order the UI lists them
    pub const ALL: [Task; 6] = [
        Task::Paraphrase,
        Task::Coherent,
        Task::Simpler,
        Task::Grammar,
        Task::Formal,
        Task::Neutral,
    ];

    /// Parse a task name, falling back to grammar correction for unknown names
    pub fn from_name(name: &str) -> Self {
        name.parse().unwrap_or_default()
    }

    /// Instruction prefix understood by CoEdIT
    pub fn instruction(&self) -> &'static str {
        match self {
            Task::Grammar => "Fix the grammar:",
            Task::Coherent => "Make this text coherent:",
            Task::Simpler => "Rewrite to make this easier to understand:",
            Task::Paraphrase => "Paraphrase this:",
            Task::Formal => "Write this more formally:",
            Task::Neutral => "Write in a more neutral way:",
        }
    }

    /// Build the model prompt for one piece of text
    pub fn prompt(&self, text: &str) -> String {
        format!("{} {}", self.instruction(), text)
    }

    /// Capitalized label, e.g. "Paraphrase"
    pub fn label(&self) -> String {
        let name = self.to_string();
        let mut chars = name.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        }
    }
}

impl FromStr for Task {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "paraphrase" => Ok(Task::Paraphrase),
            "coherent" => Ok(Task::Coherent),
            "simpler" => Ok(Task::Simpler),
            "grammar" => Ok(Task::Grammar),
            "formal" => Ok(Task::Formal),
            "neutral" => Ok(Task::Neutral),
            _ => Err(format!(
                "Invalid task: {}. Use paraphrase, coherent, simpler, grammar, formal, or neutral",
                s
            )),
        }
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::Paraphrase => write!(f, "paraphrase"),
            Task::Coherent => write!(f, "coherent"),
            Task::Simpler => write!(f, "simpler"),
            Task::Grammar => write!(f, "grammar"),
            Task::Formal => write!(f, "formal"),
            Task::Neutral => write!(f, "neutral"),
        }
    }
}

fn check_range(name: &str, value: usize, range: &RangeInclusive<usize>) -> Result<()> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(AssistantError::InvalidSettings(format!(
            "{} must be between {} and {}, got {}",
            name,
            range.start(),
            range.end(),
            value
        )))
    }
}

/// Token suggestion settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SuggestionSettings {
    pub strategy: DecodingStrategy,
    pub count: usize,
    pub words_per_suggestion: usize,
}

impl SuggestionSettings {
    pub fn validate(&self) -> Result<()> {
        check_range("Suggestion count", self.count, &SUGGESTION_COUNT_RANGE)?;
        check_range(
            "Words per suggestion",
            self.words_per_suggestion,
            &WORDS_PER_SUGGESTION_RANGE,
        )
    }
}

impl Default for SuggestionSettings {
    fn default() -> Self {
        Self {
            strategy: DecodingStrategy::Stochastic,
            count: 5,
            words_per_suggestion: 1,
        }
    }
}

/// Text transformation settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformSettings {
    pub task: Task,
    pub strategy: DecodingStrategy,
    pub max_length: usize,
}

impl TransformSettings {
    pub fn validate(&self) -> Result<()> {
        check_range("Max sentence length", self.max_length, &MAX_LENGTH_RANGE)
    }
}

impl Default for TransformSettings {
    fn default() -> Self {
        Self {
            task: Task::Paraphrase,
            strategy: DecodingStrategy::Stochastic,
            max_length: 200,
        }
    }
}

/// Where a model's files come from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSource {
    /// Hugging Face repository id, e.g. "gpt2"
    pub repo: String,
    pub revision: String,
    /// Local directory holding config.json, tokenizer.json and model.safetensors
    pub local_dir: Option<PathBuf>,
}

impl ModelSource {
    pub fn hub(repo: &str) -> Self {
        Self {
            repo: repo.to_string(),
            revision: "main".to_string(),
            local_dir: None,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    // Server
    pub host: String,
    pub port: u16,
    pub session_ttl: Duration,
    pub initial_text: String,

    // Models
    pub generator: ModelSource,
    pub corrector: ModelSource,
    pub cache_dir: PathBuf,
    pub force_cpu: bool,
    /// Load the correction model even without a GPU
    pub cpu_transform: bool,
    /// Fixed sampling seed; random per request when unset
    pub seed: Option<u64>,

    // Device configuration (not serialized)
    #[serde(skip)]
    pub device: Option<Device>,
}

impl AppConfig {
    /// Default cache location, `<cache>/writing-assistant`
    pub fn default_cache_dir() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("writing-assistant")
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Initialize and get device reference
    pub fn init_device(&mut self) -> CandleResult<&Device> {
        let device = match self.device.take() {
            Some(device) => device,
            None if self.force_cpu => Device::Cpu,
            None => Device::cuda_if_available(0)?,
        };
        Ok(&*self.device.insert(device))
    }

    /// Whether the correction model should be loaded on the given device
    pub fn transform_enabled(&self, device: &Device) -> bool {
        device.is_cuda() || self.cpu_transform
    }

    /// Apply overrides taken from a variable lookup
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("WRITING_ASSISTANT_HOST") {
            self.host = host;
        }
        if let Some(port) = lookup("WRITING_ASSISTANT_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.port = port;
        }
        if let Some(repo) = lookup("WRITING_ASSISTANT_GENERATOR_REPO") {
            self.generator.repo = repo;
        }
        if let Some(repo) = lookup("WRITING_ASSISTANT_CORRECTOR_REPO") {
            self.corrector.repo = repo;
        }
        if let Some(dir) = lookup("WRITING_ASSISTANT_CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(flag) = lookup("WRITING_ASSISTANT_CPU_TRANSFORM").and_then(|s| parse_flag(&s)) {
            self.cpu_transform = flag;
        }
        if let Some(secs) =
            lookup("WRITING_ASSISTANT_SESSION_TTL").and_then(|s| s.parse::<u64>().ok())
        {
            self.session_ttl = Duration::from_secs(secs);
        }
        self
    }

    /// Load from environment variables
    pub fn from_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Log current settings
    pub fn log_settings(&self) {
        log::info!("Writing assistant settings:");
        log::info!("  Bind address: {}", self.bind_address());
        log::info!("  Generator: {} ({})", self.generator.repo, self.generator.revision);
        log::info!("  Corrector: {} ({})", self.corrector.repo, self.corrector.revision);
        log::info!("  Cache dir: {}", self.cache_dir.display());
        log::info!("  Session TTL: {:?}", self.session_ttl);
        log::info!("  CPU transform: {}", self.cpu_transform);
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            host: "127.0.0.1".to_string(),
            port: 8501,
            session_ttl: Duration::from_secs(3600),
            initial_text: DEFAULT_TEXT.to_string(),

            generator: ModelSource::hub("gpt2"),
            corrector: ModelSource::hub("grammarly/coedit-large"),
            cache_dir: Self::default_cache_dir(),
            force_cpu: false,
            cpu_transform: false,
            seed: None,

            device: None,
        }
    }
}
