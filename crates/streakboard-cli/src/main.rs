use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use streakboard_core::{Metric, ReportRow};
use streakboard_storage::ReportRepository;
use streakboard_sync::{MessageOutcome, SyncConfig};
use streakboard_web::{AppState, WebConfig};

#[derive(Debug, Parser)]
#[command(name = "streakboard")]
#[command(about = "Weekly learning report collector and API")]
struct Cli {
    /// Log level used when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// SQLite database URL; overrides DATABASE_URL.
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch new weekly reports from the mailbox.
    Sync,
    /// Create or upgrade the database schema.
    Migrate,
    /// Serve the HTTP API.
    Serve {
        /// Overrides STREAKBOARD_WEB_PORT.
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print stored reports, newest first.
    Reports {
        #[arg(long)]
        json: bool,
    },
    /// Run classification and extraction over one Gmail-format JSON message.
    Classify { file: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    let mut config = SyncConfig::from_env();
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = streakboard_sync::pipeline_from_config(&config).await?;
            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: run_id={} candidates={} new_records={} total_records={}",
                summary.run_id, summary.candidates, summary.new_records, summary.total_records
            );
        }
        Commands::Migrate => {
            ReportRepository::open(&config.database_url)
                .await
                .with_context(|| format!("migrating {}", config.database_url))?;
            println!("database ready: {}", config.database_url);
        }
        Commands::Serve { port } => {
            let pipeline = Arc::new(streakboard_sync::pipeline_from_config(&config).await?);
            let _scheduler =
                streakboard_sync::maybe_start_scheduler(&config, Arc::clone(&pipeline)).await?;
            let mut web = WebConfig::from_env();
            if let Some(port) = port {
                web.port = port;
            }
            streakboard_web::serve(AppState::new(pipeline), &web).await?;
        }
        Commands::Reports { json } => {
            let repository = ReportRepository::open(&config.database_url).await?;
            let rows = repository
                .get_all()
                .await?
                .iter()
                .map(ReportRow::from)
                .collect::<Vec<_>>();
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                print_table(&rows);
            }
        }
        Commands::Classify { file } => {
            let message = streakboard_adapters::load_message_file(&file)?;
            match streakboard_sync::process_message(&message) {
                MessageOutcome::Report(report) => {
                    println!("weekly report: {}", report.subject);
                    for metric in Metric::ALL {
                        match report.metrics.get(&metric) {
                            Some(value) => println!("  {:<8} {value}", metric.as_str()),
                            None => println!("  {:<8} -", metric.as_str()),
                        }
                    }
                }
                MessageOutcome::NoMetrics => println!("weekly report without metrics: {}", message.subject()),
                MessageOutcome::NotAReport => println!("not a weekly report: {}", message.subject()),
            }
        }
    }

    Ok(())
}

fn print_table(rows: &[ReportRow]) {
    if rows.is_empty() {
        println!("no reports stored");
        return;
    }
    println!("{:<34} {:>7} {:>7} {:>7} {:>7}  subject", "date", "xp", "minutes", "lessons", "streak");
    for row in rows {
        println!(
            "{:<34} {:>7} {:>7} {:>7} {:>7}  {}",
            row.date, row.xp, row.minutes, row.lessons, row.streak, row.subject
        );
    }
}

fn setup_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
}
