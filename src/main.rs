mod assets;
mod catalog;
mod config;
mod db;
mod normalize;
mod output;
mod progress;
mod walker;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info};

use crate::assets::AssetResolver;
use crate::catalog::CatalogClient;
use crate::config::RunSettings;
use crate::output::OutputDir;
use crate::progress::RunTracker;
use crate::walker::{Pipeline, Walker};

#[derive(Parser)]
#[command(name = "pyq_scraper", about = "Chapter-wise previous-year question archiver")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl exams → subjects → chapters → questions and archive them
    Run(RunSettings),
    /// Show what the database sink holds
    Stats {
        #[arg(long, env = "DATABASE_URL", default_value = db::DEFAULT_DB_PATH)]
        database_url: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(settings) => run(settings).await,
        Commands::Stats { database_url } => {
            let db = db::Database::open(&database_url)?;
            let s = db.stats()?;
            println!("Chapters:  {}", s.chapters);
            println!("Questions: {} rows ({} recorded in chapter summaries)", s.questions, s.recorded_questions);
            if !s.exams.is_empty() {
                println!("\n{:<28} | {:<32} | {:>8} | {:>9}", "Exam ID", "Exam", "Chapters", "Questions");
                println!("{}", "-".repeat(86));
                for e in &s.exams {
                    println!(
                        "{:<28} | {:<32} | {:>8} | {:>9}",
                        truncate(&e.exam_id, 28),
                        truncate(&e.exam_name, 32),
                        e.chapters,
                        e.questions
                    );
                }
            }
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

async fn run(settings: RunSettings) -> anyhow::Result<()> {
    settings.validate()?;

    let output = OutputDir::create(&settings.output_dir, settings.output_compression)?;
    let db = match settings.database_url() {
        Some(url) => Some(db::Database::open(&url).context("Failed to open DATABASE_URL")?),
        None => None,
    };
    let catalog = CatalogClient::new(&settings.base_url, &settings.auth_token)?;
    let resolver = AssetResolver::new(settings.image_store().await?)?;

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {pos} questions ({per_sec})")?,
    );
    pb.enable_steady_tick(Duration::from_millis(120));

    let pipeline = Arc::new(Pipeline {
        catalog: Arc::new(catalog),
        resolver,
        output,
        db,
        tracker: RunTracker::new(settings.limits()),
        progress: pb.clone(),
    });

    info!(
        backend = ?settings.image_backend,
        compression = ?settings.output_compression,
        database = pipeline.db.is_some(),
        "Starting crawl into {:?}",
        settings.output_dir
    );

    let walker = Walker::new(Arc::clone(&pipeline), settings.filters(), settings.concurrency as usize);
    let index = walker.run().await?;
    pb.finish_and_clear();

    let Some(index) = index else {
        error!("No JEE exams found");
        return Ok(());
    };

    let path = pipeline.output.write_index(&index)?;
    info!("Wrote {} chapters to {:?}", index.chapters.len(), path);
    walker.tracker().print_status();
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
