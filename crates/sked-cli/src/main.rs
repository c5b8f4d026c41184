use anyhow::Result;
use clap::{Parser, Subcommand};
use sked_sync::{render_run_markdown, report_markdown, run_sync_once_from_env, SyncConfig, SyncPipeline};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sked")]
#[command(about = "Incremental schedule/roster sync into keyed XML stores")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, reconcile and commit every enabled source (or just one).
    Sync {
        #[arg(long)]
        source: Option<String>,
    },
    /// Fetch and reconcile, print the changes, write nothing.
    Diff {
        #[arg(long)]
        source: Option<String>,
    },
    /// Markdown digest of the most recent runs.
    Report {
        #[arg(long, default_value_t = 1)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { source: None }) {
        Commands::Sync { source } => {
            let summary = run_sync_once_from_env(source.as_deref()).await?;
            for source in &summary.sources {
                match (&source.commit, &source.skipped_reason) {
                    (Some(commit), _) => println!(
                        "{}: {} (written: {})",
                        source.source_id,
                        commit.report.summary_line(),
                        commit.written
                    ),
                    (None, Some(reason)) => println!("{}: skipped ({reason})", source.source_id),
                    (None, None) => println!("{}: nothing to do", source.source_id),
                }
            }
            println!(
                "sync complete: run_id={} sources={} reports={}",
                summary.run_id,
                summary.sources.len(),
                summary.reports_dir.as_deref().unwrap_or("-")
            );
        }
        Commands::Diff { source } => {
            let summary = SyncPipeline::new(SyncConfig::from_env())?.diff(source.as_deref()).await?;
            print!("{}", render_run_markdown(&summary, true));
        }
        Commands::Report { runs } => {
            let config = SyncConfig::from_env();
            let reports_dir = config.resolve(&config.reports_dir);
            println!("{}", report_markdown(runs, &reports_dir)?);
        }
    }

    Ok(())
}
