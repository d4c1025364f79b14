use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use car_scout::config::AppConfig;
use car_scout::models::Region;
use car_scout::queue::{SearchCriteria, SearchQueueRegistry};
use car_scout::scheduler::Scheduler;
use car_scout::storage::Database;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "car-scout", version, about = "Used-car marketplace crawler")]
struct Cli {
    /// Configuration file (defaults to car-scout.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the crawl scheduler until Ctrl-C
    Run {
        /// Process a single batch and exit
        #[arg(long)]
        once: bool,
    },
    /// Register a search and attach it to the matching crawl task
    Enqueue {
        #[arg(long)]
        search_id: i64,
        /// Brand name, created if unknown
        #[arg(long, conflicts_with = "brand_id")]
        brand: Option<String>,
        /// Model name, created under --brand if unknown
        #[arg(long, requires = "brand", conflicts_with = "model_id")]
        model: Option<String>,
        #[arg(long)]
        brand_id: Option<i64>,
        #[arg(long)]
        model_id: Option<i64>,
        #[arg(long)]
        generation: Option<String>,
        #[arg(long)]
        year_from: Option<i32>,
        #[arg(long)]
        year_to: Option<i32>,
        /// china, europe or usa; repeat for several
        #[arg(long = "region")]
        regions: Vec<Region>,
    },
    /// Remove one search-to-task link
    Detach {
        #[arg(long)]
        search_id: i64,
        #[arg(long)]
        task_id: i64,
    },
    /// Remove every link of a search
    Cancel {
        #[arg(long)]
        search_id: i64,
    },
    /// Show crawl tasks and stored listing count
    Status,
}

fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    init_logging(&config);

    let db = Database::connect(&config.database)
        .await
        .with_context(|| format!("Failed to open database {}", config.database.url))?;

    match cli.command {
        Command::Run { once } => run(&db, &config, once).await,
        Command::Enqueue {
            search_id,
            brand,
            model,
            brand_id,
            model_id,
            generation,
            year_from,
            year_to,
            regions,
        } => {
            let writer = db.writer();
            let brand_id = match brand {
                Some(name) => Some(writer.ensure_brand(&name).await?),
                None => brand_id,
            };
            let model_id = match (model, brand_id) {
                (Some(name), Some(brand_id)) => Some(writer.ensure_model(brand_id, &name).await?),
                _ => model_id,
            };

            let criteria = SearchCriteria {
                brand_id,
                model_id,
                generation,
                year_from,
                year_to,
                regions: regions.into_iter().collect::<BTreeSet<_>>(),
            };
            let registry = SearchQueueRegistry::new(db.pool().clone());
            let outcome = registry.enqueue_or_attach(&criteria, search_id).await?;
            let task = registry.task(outcome.task_id).await?;

            println!(
                "task {} (created: {}, attached: {}) priority {} regions {:?}",
                task.id, outcome.created, outcome.attached, task.priority, task.regions
            );
            Ok(())
        }
        Command::Detach { search_id, task_id } => {
            let registry = SearchQueueRegistry::new(db.pool().clone());
            if !registry.detach_demand(search_id, task_id).await? {
                warn!(search_id, task_id, "Search was not attached to that task");
            }
            Ok(())
        }
        Command::Cancel { search_id } => {
            let registry = SearchQueueRegistry::new(db.pool().clone());
            let removed = registry.cancel_search(search_id).await?;
            println!("removed {removed} link(s)");
            Ok(())
        }
        Command::Status => status(&db).await,
    }
}

async fn run(db: &Database, config: &AppConfig, once: bool) -> Result<()> {
    info!("🚗 Car Scout");
    info!("============");

    let scheduler = Scheduler::from_config(db, config)?;
    let shutdown = CancellationToken::new();

    if once {
        let processed = scheduler.run_cycle(&shutdown).await?;
        info!(processed, "✅ Single cycle finished");
        return Ok(());
    }

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested, finishing in-flight work");
            signal.cancel();
        }
    });

    scheduler.run(shutdown).await;
    Ok(())
}

async fn status(db: &Database) -> Result<()> {
    let tasks = db.tasks().list().await?;
    let listings = db.writer().count_listings().await?;

    println!("{} task(s), {} listing(s)\n", tasks.len(), listings);
    for task in &tasks {
        println!(
            "{}. [{}] {} priority {} failures {}",
            task.id,
            task.status.as_str(),
            task.filter.key(),
            task.priority,
            task.consecutive_failures
        );
        if let Some(next) = task.next_parse_at {
            println!("   next run: {}", next.to_rfc3339());
        }
        if let Some(error) = &task.last_error {
            println!("   last error: {error}");
        }
    }
    Ok(())
}
