use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use newsmig_extract::HtmlDocument;
use newsmig_sync::MigratorConfig;
use tracing_subscriber::{fmt::SubscriberBuilder, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "newsmig")]
#[command(about = "Legacy news content migrator")]
struct Cli {
    /// YAML configuration file; without it settings come from the environment.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Normalize every content record and upload its media.
    Run {
        #[arg(long)]
        batch_size: Option<usize>,
        /// Process at most this many records.
        #[arg(long)]
        limit: Option<u64>,
    },
    /// Print the normalized text and media references of one HTML file.
    Extract { file: PathBuf },
}

fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))
}

fn load_config(path: Option<&PathBuf>) -> Result<MigratorConfig> {
    match path {
        Some(path) => MigratorConfig::from_yaml_file(path),
        None => Ok(MigratorConfig::from_env()),
    }
}

/// Legacy exports mix encodings; invalid UTF-8 becomes U+FFFD instead of an error.
fn read_legacy_html(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing("info")?;

    let command = cli.command.unwrap_or(Commands::Run {
        batch_size: None,
        limit: None,
    });
    match command {
        Commands::Run { batch_size, limit } => {
            let mut config = load_config(cli.config.as_ref())?;
            if let Some(batch_size) = batch_size {
                config.batch_size = batch_size;
            }
            if limit.is_some() {
                config.row_limit = limit;
            }
            tracing::debug!(source = ?config.source, batch_size = config.batch_size, "configuration loaded");

            let summary = newsmig_sync::run_migration(&config).await?;
            println!(
                "migration complete: run_id={} records={} failed={} assets_created={} links_created={} uploads_failed={} batches={}",
                summary.run_id,
                summary.records_processed,
                summary.records_failed,
                summary.assets_created,
                summary.links_created,
                summary.uploads_failed,
                summary.batches_committed
            );
        }
        Commands::Extract { file } => {
            let html = read_legacy_html(&file)?;
            let doc = HtmlDocument::parse(&html);
            let preview = serde_json::json!({
                "text": doc.text(),
                "media": doc.media_references(),
            });
            println!("{}", serde_json::to_string_pretty(&preview)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_html_with_latin1_bytes_is_read_lossily() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("story.html");
        std::fs::write(&path, b"<p>Caf\xe9 opens today</p>").expect("write");

        let raw = read_legacy_html(&path).expect("read");
        assert_eq!(raw, "<p>Caf\u{FFFD} opens today</p>");
        assert!(read_legacy_html(&dir.path().join("missing.html")).is_err());
    }
}
