//! Main entry point for the homearc CLI application.
//!
//! Loads a home archive, lists its resources and optionally writes a
//! re-saved copy with duplicate resources merged.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use homearc::{
    ArchiveReader, ArchiveWriter, Cli, DefaultFetcher, DigestManager, LoadPhase, RecorderConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(cli.log_filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let mut config = match &cli.config {
        Some(path) => RecorderConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RecorderConfig::default(),
    };
    cli.apply(&mut config);

    let fetcher = Arc::new(DefaultFetcher::new()?);
    let backend = config.cache_backend(fetcher.client());
    let digests = Arc::new(DigestManager::new(fetcher.clone()));
    let reader = ArchiveReader::new(digests.clone())
        .with_backend(backend)
        .with_options(config.load_options());

    let progress = |phase: LoadPhase, fraction: f64| {
        tracing::debug!(?phase, percent = (fraction * 100.0).round(), "Loading");
    };
    let loaded = reader
        .read(&cli.file, &progress)
        .await
        .with_context(|| format!("loading {}", cli.file))?;

    for content in &loaded.contents {
        if cli.digests {
            match digests.digest_of(content).await {
                Ok(digest) => println!("{digest}  {content}"),
                Err(e) => {
                    tracing::warn!(url = %content.url(), error = %e, "Cannot digest resource");
                    println!("{:28}  {content}", "-");
                }
            }
        } else {
            println!("{content}");
        }
    }

    if let Some(out) = &cli.output {
        let name = out
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| out.display().to_string());
        let saved = ArchiveWriter::new(digests)
            .write(&loaded.graph, &name, &config.save_options(), &CancellationToken::new())
            .await
            .with_context(|| format!("saving {}", out.display()))?;
        let data = saved.output.to_bytes()?;
        tokio::fs::write(out, &data).await?;

        if !cli.is_quiet() {
            eprintln!(
                "\nSaved {} resource entries from {} references to {} ({} bytes)",
                saved.resource_entries,
                loaded.contents.len(),
                out.display(),
                data.len()
            );
        }
    }

    Ok(())
}
