use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use clause_rag::rag::{normalize, ChunkStrategy, ClauseChunker};
use clause_rag::source::HttpDocumentSource;
use clause_rag::{logging, server, tokenizer, Pipeline, RagConfig};

#[derive(Parser, Debug)]
#[command(name = "clause-rag", about = "Question answering over policy documents, grounded in their clauses")]
struct Cli {
    /// Config file (defaults to <config_dir>/clause-rag/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the HTTP API until interrupted
    Serve,
    /// Answer questions about one document and print the answers as JSON
    Ask {
        #[arg(long)]
        document: String,
        #[arg(long = "question", required = true)]
        questions: Vec<String>,
    },
    /// Build (or reuse) the persisted index for a document
    Index {
        #[arg(long)]
        document: String,
        /// Rebuild even when a fresh index exists
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Print the chunk collection of a local text file as JSON
    Chunk {
        #[arg(long)]
        file: PathBuf,
        /// Override the configured strategy: clause, token or recursive
        #[arg(long)]
        strategy: Option<ChunkStrategy>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RagConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    logging::init(&config.logging);

    match cli.command {
        Command::Serve => serve(&config).await,
        Command::Ask { document, questions } => {
            let pipeline = Pipeline::from_config(&config).context("failed to set up pipeline")?;
            let answers = pipeline
                .run(&document, &questions)
                .await
                .with_context(|| format!("failed to prepare {document}"))?;
            println!("{}", serde_json::to_string_pretty(&answers)?);
            Ok(())
        }
        Command::Index { document, force } => {
            let pipeline = Pipeline::from_config(&config).context("failed to set up pipeline")?;
            let index = pipeline
                .prepare(&document, force)
                .await
                .with_context(|| format!("failed to index {document}"))?;
            println!(
                "{} chunks indexed at {}",
                index.len(),
                pipeline.index_dir(&document).display()
            );
            Ok(())
        }
        Command::Chunk { file, strategy } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let c = &config.chunking;
            let tokenizer = tokenizer::load(c.tokenizer_path.as_deref())?;
            let strategy = strategy.unwrap_or(c.strategy);
            let chunks = ClauseChunker::new(tokenizer, strategy, c.max_tokens, c.overlap_tokens)?
                .chunk_collection(&normalize(&raw))?;
            println!("{}", serde_json::to_string_pretty(&chunks)?);
            Ok(())
        }
    }
}

async fn serve(config: &RagConfig) -> Result<()> {
    // clients name documents by URL; local paths stay a CLI-only feature
    let source = Arc::new(HttpDocumentSource::new(&config.source)?.remote_only());
    let pipeline = Arc::new(Pipeline::with_source(config, source).context("failed to set up pipeline")?);
    let handle = server::start_server(pipeline, &config.server).await?;
    tracing::info!(addr = %handle.addr, "Listening");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    tracing::info!("Interrupted, stopping server");
    handle.stop().await;
    Ok(())
}
