use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use writing_assistant::assistant::{device_label, Assistant};
use writing_assistant::config::{
    AppConfig, DecodingStrategy, SuggestionSettings, Task, TransformSettings,
};
use writing_assistant::inference::Suggester;
use writing_assistant::io::{load_gpt2, HubClient};
use writing_assistant::server::{self, AppState};
use writing_assistant::session::{suggestion_label, SessionStore};
use writing_assistant::WritingAssistant;

#[derive(Parser)]
#[command(
    name = "writing-assistant",
    version = "0.1.0",
    about = "Writing assistant with GPT-2 suggestions and CoEdIT rewrites",
    long_about = "Writing Assistant - next-word suggestions and text rewriting in the browser\n\
                  \n\
                  Examples:\n\
                    # Start the web UI on http://127.0.0.1:8501\n\
                    writing-assistant\n\
                    \n\
                    # One-shot suggestions\n\
                    writing-assistant suggest --text \"Strong with the force\" --count 3\n\
                    \n\
                    # One-shot rewrite\n\
                    writing-assistant transform --text \"me go home\" --task grammar"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the web UI (default)
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// Hugging Face repository of the suggestion model
        #[arg(long)]
        generator_repo: Option<String>,

        /// Hugging Face repository of the correction model
        #[arg(long)]
        corrector_repo: Option<String>,

        /// Load the suggestion model from a local directory instead
        #[arg(long)]
        generator_dir: Option<PathBuf>,

        /// Load the correction model from a local directory instead
        #[arg(long)]
        corrector_dir: Option<PathBuf>,

        /// Run on the CPU even when a GPU is available
        #[arg(long)]
        cpu: bool,

        /// Enable text transformation without a GPU
        #[arg(long)]
        cpu_transform: bool,

        /// Directory for downloaded model files
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// Idle seconds before a session is dropped
        #[arg(long)]
        session_ttl: Option<u64>,

        /// Fixed sampling seed
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Print suggestions for a text and exit
    Suggest {
        #[arg(short, long)]
        text: String,

        #[arg(short, long, default_value = "5")]
        count: usize,

        #[arg(short, long, default_value = "1")]
        words: usize,

        /// Decoding strategy (stochastic or greedy)
        #[arg(short, long, default_value = "stochastic")]
        strategy: DecodingStrategy,

        #[arg(long)]
        cpu: bool,

        #[arg(long)]
        seed: Option<u64>,
    },

    /// Print a rewrite of a text and exit
    Transform {
        #[arg(short, long)]
        text: String,

        /// Task (paraphrase, coherent, simpler, grammar, formal, neutral)
        #[arg(long, default_value = "grammar")]
        task: Task,

        /// Decoding strategy (stochastic or greedy)
        #[arg(short, long, default_value = "stochastic")]
        strategy: DecodingStrategy,

        /// Maximum tokens per sentence
        #[arg(long, default_value = "200")]
        max_length: usize,

        #[arg(long)]
        cpu: bool,

        #[arg(long)]
        seed: Option<u64>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    println!("{}", "=".repeat(60).bright_blue());
    println!("{}", "Writing Assistant - suggestions and rewrites".bright_white().bold());
    println!("{}", "Version 0.1.0 - Rust + Candle Edition".bright_white());
    println!("{}", "=".repeat(60).bright_blue());
    println!();

    let mut config = AppConfig::default().from_env_overrides();
    let rt = tokio::runtime::Runtime::new()?;

    match cli.command {
        Some(Commands::Serve {
            host,
            port,
            generator_repo,
            corrector_repo,
            generator_dir,
            corrector_dir,
            cpu,
            cpu_transform,
            cache_dir,
            session_ttl,
            seed,
        }) => {
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(repo) = generator_repo {
                config.generator.repo = repo;
            }
            if let Some(repo) = corrector_repo {
                config.corrector.repo = repo;
            }
            if generator_dir.is_some() {
                config.generator.local_dir = generator_dir;
            }
            if corrector_dir.is_some() {
                config.corrector.local_dir = corrector_dir;
            }
            if let Some(dir) = cache_dir {
                config.cache_dir = dir;
            }
            if let Some(secs) = session_ttl {
                config.session_ttl = Duration::from_secs(secs);
            }
            config.force_cpu |= cpu;
            config.cpu_transform |= cpu_transform;
            config.seed = seed.or(config.seed);

            rt.block_on(serve(config))?;
        }

        Some(Commands::Suggest {
            text,
            count,
            words,
            strategy,
            cpu,
            seed,
        }) => {
            config.force_cpu |= cpu;
            config.seed = seed.or(config.seed);
            let settings = SuggestionSettings {
                strategy,
                count,
                words_per_suggestion: words,
            };
            settings.validate()?;

            let suggester = rt.block_on(load_suggester(&mut config))?;
            let suggestions = suggester.suggest(&text, &settings)?;

            println!("{}", text.bright_white());
            if suggestions.is_empty() {
                println!("{}", "No suggestions!".bright_yellow());
            }
            for (i, suggestion) in suggestions.iter().enumerate() {
                println!(
                    "  {} {}",
                    format!("[{}]", i + 1).bright_cyan(),
                    suggestion_label(suggestion)
                );
            }
        }

        Some(Commands::Transform {
            text,
            task,
            strategy,
            max_length,
            cpu,
            seed,
        }) => {
            config.force_cpu |= cpu;
            config.seed = seed.or(config.seed);
            // Asking for a rewrite explicitly is enough to load the model on CPU
            config.cpu_transform = true;
            let settings = TransformSettings {
                task,
                strategy,
                max_length,
            };
            settings.validate()?;

            let assistant = rt.block_on(WritingAssistant::load(&mut config))?;
            let rewritten = assistant.transform(&text, &settings)?;

            println!("{}", format!("{}:", task.label()).bright_cyan());
            println!("{}", rewritten.bright_white());
        }

        None => {
            rt.block_on(serve(config))?;
        }
    }

    Ok(())
}

async fn serve(mut config: AppConfig) -> Result<()> {
    config.log_settings();

    let assistant = WritingAssistant::load(&mut config).await?;
    if !assistant.transform_available() {
        println!(
            "{}",
            "Text transformation disabled: no GPU found (use --cpu-transform to enable it)"
                .bright_yellow()
        );
    }

    let sessions = SessionStore::new(&config.initial_text, config.session_ttl);
    let state = AppState::new(Arc::new(assistant), sessions);

    println!(
        "{}",
        format!("Open http://{} in your browser", config.bind_address()).bright_green().bold()
    );
    server::serve(state, &config.bind_address()).await
}

/// Load only the suggestion model
async fn load_suggester(config: &mut AppConfig) -> Result<Suggester> {
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
    Ok(Suggester::new(model, tokenizer).with_seed(config.seed))
}
