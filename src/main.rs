//! session-optimizer CLI - Inspect pricing, model selection and recorded agent sessions

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use session_optimizer::{
    config::Config,
    interceptor::{LoggingCollector, Message},
    optimization::{CostEstimator, ModelSelector, ModelTier, TaskProfile},
    CostOptimizer, SessionCore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "session-optimizer")]
#[command(about = "Cost control and caching for AI coding-agent sessions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Config file (default: ~/.config/session-optimizer/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Price a model call
    Estimate {
        /// Model tier (haiku, sonnet, sonnet_extended, opus)
        tier: ModelTier,

        /// Input tokens
        tokens_in: u64,

        /// Output tokens
        tokens_out: u64,
    },

    /// Pick a model tier for a task
    Select {
        /// Complexity score (0.0 - 1.0)
        score: f64,

        /// Context tokens the task will send
        context_tokens: u64,

        /// Expected output tokens
        #[arg(short, long, default_value = "2000")]
        output_tokens: u64,

        /// Tiers to skip (comma-separated)
        #[arg(short, long, value_delimiter = ',')]
        exclude: Vec<ModelTier>,
    },

    /// Stream a recorded session (JSON lines of messages) through the collectors
    Replay {
        /// JSONL file, one message per line
        input: PathBuf,

        /// Operation name shown in the metrics
        #[arg(short, long, default_value = "replay")]
        operation: String,

        /// Print the final metrics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Initialize configuration file with defaults
    Init {
        /// Overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Show current configuration
    Show {
        /// Show only specific section (models, budget, cache, interceptor, metrics)
        #[arg(short, long)]
        section: Option<String>,
    },

    /// Show configuration file path
    Path,

    /// Validate configuration
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = cli.config.unwrap_or_else(Config::default_path);

    match cli.command {
        Commands::Estimate {
            tier,
            tokens_in,
            tokens_out,
        } => {
            run_estimate(&load_config(&config_path)?, tier, tokens_in, tokens_out)?;
        }
        Commands::Select {
            score,
            context_tokens,
            output_tokens,
            exclude,
        } => {
            run_select(
                &load_config(&config_path)?,
                score,
                context_tokens,
                output_tokens,
                &exclude,
            )?;
        }
        Commands::Replay {
            input,
            operation,
            json,
        } => {
            run_replay(&load_config(&config_path)?, input, &operation, json).await?;
        }
        Commands::Config(cmd) => {
            run_config_command(cmd, config_path)?;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    let config = Config::load_from(path.to_path_buf())
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn run_estimate(config: &Config, tier: ModelTier, tokens_in: u64, tokens_out: u64) -> Result<()> {
    let estimator = CostEstimator::new(config.price_table()?);
    let estimate = estimator.estimate(tier, tokens_in, tokens_out);

    println!("=== Cost Estimate ===");
    println!("Model: {}", estimate.model_tier);
    println!("Input tokens: {}", estimate.tokens_in);
    println!("Output tokens: {}", estimate.tokens_out);
    println!("Estimated cost: ${:.6}", estimate.estimated_cost);

    println!();
    println!("All tiers:");
    for other in ModelTier::ALL {
        let cost = estimator.estimate(other, tokens_in, tokens_out).estimated_cost;
        let marker = if other == tier { "*" } else { " " };
        println!("  {} {:<16} ${:.6}", marker, other.as_str(), cost);
    }

    Ok(())
}

fn run_select(
    config: &Config,
    score: f64,
    context_tokens: u64,
    output_tokens: u64,
    exclude: &[ModelTier],
) -> Result<()> {
    let optimizer = CostOptimizer::from_config(config)?;
    let selector: &ModelSelector = optimizer.selector();
    let task = TaskProfile {
        complexity_score: score,
        context_tokens,
        expected_output_tokens: output_tokens,
    };

    let selection = optimizer.plan_excluding(&task, exclude)?;

    println!("=== Model Selection ===");
    println!(
        "Required capability: {:?}",
        selector.required_capability(score)
    );
    println!("Selected: {}", selection.tier);
    println!("Estimated cost: ${:.6}", selection.estimate.estimated_cost);
    println!(
        "Savings vs {}: ${:.6}",
        selection.baseline, selection.savings_vs_baseline
    );

    let budget = optimizer.budget();
    if !budget.check_available(&budget.current_period_id(), selection.estimate.estimated_cost) {
        warn!("Estimated cost exceeds the remaining budget for this period");
    }

    Ok(())
}

async fn run_replay(config: &Config, input: PathBuf, operation: &str, json: bool) -> Result<()> {
    let content = std::fs::read_to_string(&input)
        .with_context(|| format!("Failed to read {}", input.display()))?;

    let session = SessionCore::from_config(operation, config)?;
    let logger = Arc::new(LoggingCollector::new("log"));
    session.interceptor().register(logger.clone())?;

    info!("Replaying {}", input.display());

    let lines: Vec<Result<Message, String>> = content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            serde_json::from_str::<Message>(line).map_err(|e| format!("line {}: {}", i + 1, e))
        })
        .collect();

    let stream = session.interceptor().intercept(tokio_stream::iter(lines));
    tokio::pin!(stream);

    let mut replayed = 0usize;
    while let Some(item) = stream.next().await {
        match item {
            Ok(_) => replayed += 1,
            Err(e) => {
                warn!("Stopping replay at malformed message ({})", e);
                break;
            }
        }
    }
    session.interceptor().flush().await;

    let snapshot = session.snapshot();
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        println!("{}", snapshot);
        println!("{}", session.report());
    }

    let statuses = session.shutdown().await;
    for status in statuses.iter().filter(|s| s.error_count > 0 || s.dropped > 0) {
        warn!(
            "Collector {} had {} errors and {} dropped messages",
            status.name, status.error_count, status.dropped
        );
    }
    info!("Replayed {} messages ({} logged)", replayed, logger.count());

    Ok(())
}

fn run_config_command(cmd: ConfigCommands, path: PathBuf) -> Result<()> {
    match cmd {
        ConfigCommands::Init { force } => {
            config_init(path, force)?;
        }
        ConfigCommands::Show { section } => {
            config_show(&path, section)?;
        }
        ConfigCommands::Path => {
            println!("{}", path.display());
            if !path.exists() {
                println!("(file does not exist, using defaults)");
            }
        }
        ConfigCommands::Validate => {
            let config = Config::load_from(path.clone())?;
            match config.validate() {
                Ok(()) => println!("Configuration is valid: {}", path.display()),
                Err(e) => println!("Configuration is invalid: {}", e),
            }
        }
    }
    Ok(())
}

fn config_init(path: PathBuf, force: bool) -> Result<()> {
    if path.exists() && !force {
        println!("Configuration file already exists at: {}", path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, Config::example())?;

    println!("Configuration file created at: {}", path.display());
    println!();
    println!("Override the spend limit without editing it:");
    println!("  export SESSION_OPTIMIZER_BUDGET=25.0");

    Ok(())
}

fn config_show(path: &Path, section: Option<String>) -> Result<()> {
    let config = Config::load_from(path.to_path_buf())?;

    let display = match section.as_deref().map(str::to_lowercase).as_deref() {
        None => toml::to_string_pretty(&config)?,
        Some("models") => toml::to_string_pretty(&config.models)?,
        Some("budget") => toml::to_string_pretty(&config.budget)?,
        Some("cache") => toml::to_string_pretty(&config.cache)?,
        Some("interceptor") => toml::to_string_pretty(&config.interceptor)?,
        Some("metrics") => toml::to_string_pretty(&config.metrics)?,
        Some(other) => anyhow::bail!("Unknown config section: {}", other),
    };

    println!("{}", display);
    Ok(())
}
