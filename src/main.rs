use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use adaptive_engine::config::{Config, EngineConfig};
use adaptive_engine::db::{DataSources, SqliteStore, StoreError};
use adaptive_engine::logging::init_tracing;
use adaptive_engine::services::{PredictionContext, PredictionError};
use adaptive_engine::types::ExerciseAttempt;
use adaptive_engine::{AdaptiveEngine, ModelRegistry};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Prediction(#[from] PredictionError),
    #[error(transparent)]
    Registry(#[from] adaptive_engine::registry::RegistryError),
    #[error("failed to encode output: {0}")]
    Output(#[from] serde_json::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Adaptive difficulty and performance prediction over a learner database.
#[derive(Parser)]
#[command(name = "adaptive-engine", version)]
struct Cli {
    /// SQLite database file; defaults to ENGINE_DB_PATH, then the user data directory
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Target {
    Difficulty,
    Success,
}

impl From<Target> for PredictionContext {
    fn from(target: Target) -> Self {
        match target {
            Target::Difficulty => PredictionContext::Difficulty,
            Target::Success => PredictionContext::Success,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Recommend the next difficulty level
    Recommend {
        user: String,
        domain: String,
        /// Skip the flow zone adjustment
        #[arg(long)]
        raw: bool,
    },
    /// Probability of succeeding on the next attempt
    Probability { user: String, domain: String },
    /// Rank learners by risk of failure
    AtRisk {
        domain: String,
        #[arg(required = true)]
        users: Vec<String>,
        #[arg(long)]
        threshold: Option<f64>,
    },
    /// Project when a learner reaches mastery
    Timeline {
        user: String,
        domain: String,
        #[arg(long)]
        target: Option<f64>,
    },
    /// Day-by-day success forecast
    Forecast {
        user: String,
        domain: String,
        #[arg(long, default_value_t = 7)]
        days: u32,
    },
    /// Per-feature attribution of a prediction
    Explain {
        #[arg(value_enum)]
        model: Target,
        user: String,
        domain: String,
        /// Number of contributors to keep
        #[arg(long)]
        top: Option<usize>,
    },
    /// Ranked feature importances of the active model
    Importances {
        #[arg(value_enum)]
        model: Target,
    },
    /// Registered versions of a model, newest first
    Models { name: String },
    /// Append an exercise attempt
    Record {
        user: String,
        domain: String,
        difficulty: u8,
        #[arg(long)]
        correct: bool,
        #[arg(long)]
        seconds: Option<f64>,
        #[arg(long)]
        strategy: Option<String>,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli, config: Config) -> Result<(), CliError> {
    let store = match cli.db.or(config.database_path) {
        Some(path) => SqliteStore::open(&path).await?,
        None => SqliteStore::open_default().await?,
    };
    let store = Arc::new(store);
    let registry = Arc::new(ModelRegistry::new(store.clone()));
    let engine = AdaptiveEngine::new(DataSources::from_store(store), registry, EngineConfig::from_env());
    engine.reload_models().await?;

    match cli.command {
        Command::Recommend { user, domain, raw } => {
            let (_, explanation) = if raw {
                engine.difficulty().predict(&user, &domain, false).await
            } else {
                engine.recommend_difficulty(&user, &domain).await
            };
            print_json(&explanation)
        }
        Command::Probability { user, domain } => {
            let (_, explanation) = engine.success_probability(&user, &domain).await;
            print_json(&explanation)
        }
        Command::AtRisk {
            domain,
            users,
            threshold,
        } => print_json(&engine.at_risk(&users, &domain, threshold).await),
        Command::Timeline { user, domain, target } => {
            print_json(&engine.mastery_timeline(&user, &domain, target).await?)
        }
        Command::Forecast { user, domain, days } => {
            print_json(&engine.forecast(&user, &domain, days).await?)
        }
        Command::Explain {
            model,
            user,
            domain,
            top,
        } => match model {
            Target::Difficulty => {
                let (_, attribution) = engine.explain_difficulty(&user, &domain, top).await?;
                print_json(&attribution)
            }
            Target::Success => {
                let (_, attribution) = engine.explain_success(&user, &domain, top).await?;
                print_json(&attribution)
            }
        },
        Command::Importances { model } => {
            print_json(&engine.feature_importances(model.into()).await?)
        }
        Command::Models { name } => print_json(&engine.registry().history(&name).await?),
        Command::Record {
            user,
            domain,
            difficulty,
            correct,
            seconds,
            strategy,
        } => {
            if !(1..=5).contains(&difficulty) {
                return Err(CliError::InvalidArgument(format!(
                    "difficulty {difficulty} outside 1..=5"
                )));
            }
            let mut attempt = ExerciseAttempt::new(&user, &domain, difficulty, correct, Utc::now());
            if let Some(seconds) = seconds {
                attempt = attempt.with_time(seconds);
            }
            if let Some(strategy) = strategy.as_deref() {
                attempt = attempt.with_strategy(strategy);
            }
            engine.record_attempt(attempt).await?;
            tracing::info!(user = %user, domain = %domain, "attempt recorded");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let config = Config::from_env();
    let log_guard = init_tracing(&config.log_level);

    let cli = Cli::parse();
    let result = run(cli, config).await;
    if let Err(err) = &result {
        tracing::error!(error = %err, "command failed");
        eprintln!("error: {err}");
    }

    drop(log_guard);
    if result.is_err() {
        std::process::exit(1);
    }
}
