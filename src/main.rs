use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::error;

use catalog_worker::{
    config::Config,
    observability,
    pipeline::{CatalogPipeline, RunContext},
};

/// ポッドキャストカタログのバッチパイプラインを段階ごとに実行するCLI。
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch the podcast feed and persist the episode catalog.
    Ingest { podcast: String },
    /// Embed episode texts into vectors for the persisted catalog.
    Embed { podcast: String },
    /// Assign episodes to clusters, exploring cluster counts when -k is omitted.
    Cluster {
        podcast: String,
        /// Fixed cluster count. Omit to select one by silhouette score.
        #[arg(short, long)]
        k: Option<usize>,
    },
    /// Apply the curated label table to clustered episodes.
    Label { podcast: String },
    /// Assemble the labeled catalog into the delivery JSON.
    Export { podcast: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    std::panic::set_hook(Box::new(|panic_info| {
        let thread = std::thread::current();
        let thread_name = thread.name().unwrap_or("unnamed");
        let message = panic_info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| {
                panic_info
                    .payload()
                    .downcast_ref::<String>()
                    .map(|s| s.as_str())
            })
            .unwrap_or("unknown panic payload");

        if let Some(location) = panic_info.location() {
            error!(
                thread = thread_name,
                file = location.file(),
                line = location.line(),
                column = location.column(),
                message,
                "panic occurred"
            );
        } else {
            error!(
                thread = thread_name,
                message, "panic occurred without location information"
            );
        }
    }));

    let cli = Cli::parse();
    observability::init().context("failed to initialize tracing")?;
    let config = Config::from_env().context("failed to load configuration")?;
    let pipeline = CatalogPipeline::from_config(Arc::new(config))
        .context("failed to build catalog pipeline")?;

    match cli.command {
        Command::Ingest { podcast } => {
            let ctx = RunContext::new(podcast);
            let summary = pipeline.run_ingest(&ctx).await?;
            println!("{summary}");
        }
        Command::Embed { podcast } => {
            let ctx = RunContext::new(podcast);
            let summary = pipeline.run_embed(&ctx).await?;
            println!("{summary}");
        }
        Command::Cluster { podcast, k } => {
            let ctx = RunContext::new(podcast);
            let summary = pipeline.run_cluster(&ctx, k).await?;
            println!("{summary}");
        }
        Command::Label { podcast } => {
            let ctx = RunContext::new(podcast);
            let summary = pipeline.run_label(&ctx).await?;
            println!("{summary}");
        }
        Command::Export { podcast } => {
            let ctx = RunContext::new(podcast);
            let summary = pipeline.run_export(&ctx).await?;
            println!("{summary}");
        }
    }

    Ok(())
}
