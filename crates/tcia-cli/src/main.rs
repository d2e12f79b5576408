use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tcia_sync::{SyncConfig, SyncError, DATASET_TABLE_FILE};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tcia-cli")]
#[command(about = "TCIA catalog sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every feed, reconcile, and rewrite the dataset table.
    Sync {
        /// Print the run summary as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Serve the read-only dataset API.
    Serve,
    /// Check that a persisted table looks populated.
    Verify {
        /// Table to check; defaults to the configured output directory.
        #[arg(long)]
        table: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let outcome = match cli.command.unwrap_or(Commands::Sync { json: false }) {
        Commands::Sync { json } => sync(json).await,
        Commands::Serve => tcia_web::serve_from_env().await.map(|()| ExitCode::SUCCESS),
        Commands::Verify { table } => verify(table),
    };

    match outcome {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn sync(json: bool) -> Result<ExitCode> {
    let summary = match tcia_sync::run_sync_once_from_env().await {
        Ok(summary) => summary,
        Err(SyncError::SourceFetch { feed, message }) => {
            error!(feed = %feed, "sync aborted; previous artifacts left in place");
            eprintln!("sync failed: could not fetch the {feed} feed: {message}");
            return Ok(ExitCode::from(2));
        }
        Err(SyncError::Persist(err)) => return Err(err.context("sync failed while persisting")),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "sync complete: run_id={} datasets={} downloads={} citations_fetched={} citations_failed={} anomalies={} table={}",
            summary.run_id,
            summary.datasets,
            summary.downloads.attached,
            summary.citations.fetched,
            summary.citations.failed,
            summary.anomalies,
            summary.table_path
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn verify(table: Option<PathBuf>) -> Result<ExitCode> {
    let path = match table {
        Some(path) => path,
        None => SyncConfig::from_env()?.output_dir.join(DATASET_TABLE_FILE),
    };
    let report = tcia_sync::verify_table(&path)?;

    let mark = |ok: bool| if ok { "ok" } else { "MISSING" };
    println!("table: {} ({} rows)", path.display(), report.rows);
    println!("doi populated: {}", mark(report.doi_populated));
    println!("summary populated: {}", mark(report.summary_populated));
    println!("citation populated: {}", mark(report.citation_populated));
    match &report.first_with_downloads {
        Some(title) => println!("downloads: ok (first: {title})"),
        None => println!("downloads: MISSING"),
    }
    println!(
        "number_of_subjects: {} distinct values ({})",
        report.distinct_subject_counts,
        mark(report.subjects_vary())
    );

    Ok(if report.passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
