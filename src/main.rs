mod ai;
mod cache;
mod config;
mod db;
mod error;
mod generator;
mod models;
mod profile;
mod refresh;
#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cache::InsightCache;
use config::{ApiKeys, EngineConfig, RetryPolicy};
use db::Database;
use generator::InsightGenerator;
use error::EngineError;
use models::{CallerIdentity, IndustryKey, ProfileUpdate};
use profile::ProfileService;
use refresh::{KeyOutcome, RefreshJob};

#[derive(Parser)]
#[command(name = "insights")]
#[command(about = "Industry insights - generate, cache and refresh market analytics per industry")]
struct Cli {
    /// Path to the SQLite database (defaults to the platform data directory)
    #[arg(long, env = "INSIGHTS_DB", global = true)]
    db: Option<PathBuf>,

    /// Model used for generation (gemini, gemini-pro, api-sonnet, gpt-4o, claude-sonnet, ...)
    #[arg(long, env = "INSIGHTS_MODEL", default_value = "gemini", global = true)]
    model: String,

    /// Days between generating an insight and its next refresh
    #[arg(long, env = "INSIGHTS_REFRESH_DAYS", default_value_t = config::DEFAULT_REFRESH_DAYS, global = true)]
    refresh_days: i64,

    /// Generator attempts per key per refresh run
    #[arg(long, env = "INSIGHTS_MAX_ATTEMPTS", default_value_t = config::DEFAULT_MAX_ATTEMPTS, global = true)]
    max_attempts: u32,

    /// Keys refreshed in parallel
    #[arg(long, env = "INSIGHTS_CONCURRENCY", default_value_t = config::DEFAULT_CONCURRENCY, global = true)]
    concurrency: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct UserArgs {
    /// Caller identity (as issued by the identity provider)
    #[arg(short, long)]
    user: Option<String>,

    /// Email to record when the profile is first created
    #[arg(long)]
    email: Option<String>,

    /// Display name to record when the profile is first created
    #[arg(long)]
    name: Option<String>,
}

impl UserArgs {
    fn identity(&self) -> Option<CallerIdentity> {
        self.user.as_ref().map(|id| CallerIdentity {
            user_id: id.clone(),
            email: self.email.clone(),
            name: self.name.clone(),
        })
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Show the insight for an industry, generating it if missing
    Insight {
        /// Industry, e.g. "tech software-development"
        industry: String,
    },

    /// Update a user's profile and industry
    Profile {
        #[command(flatten)]
        user: UserArgs,

        /// Industry the user works in
        #[arg(short, long)]
        industry: String,

        /// Years of experience
        #[arg(long)]
        experience: Option<u32>,

        /// Short bio
        #[arg(long)]
        bio: Option<String>,

        /// Comma-separated skills
        #[arg(long, value_delimiter = ',')]
        skills: Vec<String>,
    },

    /// Show whether a user has completed onboarding
    Status {
        #[command(flatten)]
        user: UserArgs,
    },

    /// Show the insight for a user's industry
    Dashboard {
        #[command(flatten)]
        user: UserArgs,
    },

    /// List cached insights
    List,

    /// List industries due for a refresh
    Stale,

    /// Refresh all stale insights once
    Refresh,

    /// Refresh stale insights periodically until interrupted
    Schedule {
        /// Hours between sweeps (default: weekly)
        #[arg(long)]
        every_hours: Option<u64>,
    },
}

impl Cli {
    fn engine_config(&self) -> Result<EngineConfig, EngineError> {
        Ok(EngineConfig {
            refresh_interval: EngineConfig::refresh_interval_days(self.refresh_days)?,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                ..RetryPolicy::default()
            },
            refresh_concurrency: self.concurrency,
            ..EngineConfig::default()
        })
    }
}

fn build_generator(model: &str, config: &EngineConfig) -> Result<Arc<InsightGenerator>> {
    let spec = ai::resolve_model(model)?;
    info!(model = %spec.short_name, model_id = %spec.model_id, "using generator model");
    let provider = ai::create_provider(&spec, &ApiKeys::from_env())?;
    Ok(Arc::new(InsightGenerator::new(provider, config.max_tokens)))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("insights=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        if e.downcast_ref::<EngineError>().is_some_and(EngineError::is_retryable) {
            eprintln!("The generator is unavailable right now; try again later.");
        }
        return Err(e);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = Arc::new(cli.engine_config()?);
    config.validate()?;

    let db = match &cli.db {
        Some(path) => Database::open_at(path)?,
        None => Database::open()?,
    };

    if let Commands::Init = cli.command {
        db.init().await?;
        match db.path() {
            Some(path) => println!("Database initialized at {}", path.display()),
            None => println!("Database initialized"),
        }
        return Ok(());
    }
    db.ensure_initialized().await?;

    match &cli.command {
        Commands::Init => {}

        Commands::Insight { industry } => {
            let industry = IndustryKey::parse(industry)?;
            let cache = InsightCache::new(db, build_generator(&cli.model, &config)?, config);
            let record = cache.get_or_create(&industry).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }

        Commands::Profile {
            user,
            industry,
            experience,
            bio,
            skills,
        } => {
            let update = ProfileUpdate {
                industry: IndustryKey::parse(industry)?,
                experience: *experience,
                bio: bio.clone(),
                skills: skills
                    .iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            };
            let profiles = ProfileService::new(db, build_generator(&cli.model, &config)?, config);
            let updated = profiles
                .update_profile(user.identity().as_ref(), update)
                .await?;
            println!(
                "Profile for '{}' updated: industry = {}",
                updated.profile.external_id, updated.insight.industry
            );
            println!("Next insight refresh: {}", updated.insight.next_update);
        }

        Commands::Status { user } => {
            let status = profile::onboarding_status(&db, user.identity().as_ref()).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Commands::Dashboard { user } => {
            let cache = InsightCache::new(db.clone(), build_generator(&cli.model, &config)?, config);
            let record = profile::insights_for_user(&db, &cache, user.identity().as_ref()).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }

        Commands::List => {
            let records = db.list_insights().await?;
            if records.is_empty() {
                println!("No insights cached.");
            } else {
                let now = chrono::Utc::now();
                println!(
                    "{:<30} {:<8} {:<10} {:>8} {:<20}",
                    "INDUSTRY", "DEMAND", "OUTLOOK", "GROWTH", "NEXT UPDATE"
                );
                println!("{}", "-".repeat(86));
                for r in records {
                    println!(
                        "{:<30} {:<8} {:<10} {:>7.1}% {:<20}{}",
                        truncate(r.industry.as_str(), 28),
                        r.payload.demand_level.as_str(),
                        r.payload.market_outlook.as_str(),
                        r.payload.growth_rate,
                        r.next_update.format("%Y-%m-%d %H:%M"),
                        if r.is_stale(now) { " stale" } else { "" }
                    );
                }
            }
        }

        Commands::Stale => {
            let stale = db.list_stale(chrono::Utc::now()).await?;
            if stale.is_empty() {
                println!("Nothing is due for a refresh.");
            } else {
                for industry in stale {
                    println!("{}", industry);
                }
            }
        }

        Commands::Refresh => {
            let job = RefreshJob::new(db, build_generator(&cli.model, &config)?, config);
            let report = job.run_once().await?;
            if report.outcomes.is_empty() {
                println!("Nothing to refresh.");
            }
            for (industry, outcome) in &report.outcomes {
                match outcome {
                    KeyOutcome::Refreshed { attempts } => {
                        println!("  refreshed  {} ({} attempt(s))", industry, attempts)
                    }
                    KeyOutcome::AlreadyFresh => println!("  skipped    {} (already fresh)", industry),
                    KeyOutcome::Failed { error, .. } => println!("  failed     {}: {}", industry, error),
                }
            }
            println!(
                "\nRefreshed: {}  Failed: {}",
                report.refreshed().len(),
                report.failed().len()
            );
        }

        Commands::Schedule { every_hours } => {
            let every = schedule_period(*every_hours);
            let job = RefreshJob::new(db, build_generator(&cli.model, &config)?, config);

            let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
            let handle = tokio::spawn(async move { job.run_scheduled(every, shutdown_rx).await });

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            let _ = shutdown_tx.send(());
            handle.await?;
        }
    }

    Ok(())
}

/// Sweep period for `schedule`, clamped to between one hour and the longest
/// allowed refresh interval.
fn schedule_period(every_hours: Option<u64>) -> Duration {
    let max_hours = config::MAX_REFRESH_DAYS.unsigned_abs().saturating_mul(24);
    every_hours
        .map(|h| Duration::from_secs(h.clamp(1, max_hours).saturating_mul(60 * 60)))
        .unwrap_or(refresh::DEFAULT_SCHEDULE)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
