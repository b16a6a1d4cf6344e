use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use recall::config::load_config;
use recall::engine::{QueryEngine, QueryOptions};

#[derive(Parser)]
#[command(name = "recall")]
#[command(about = "Local-first knowledge base with semantic retrieval and session-aware navigation")]
#[command(version)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "recall.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and run migrations
    Init,
    /// Ingest a text file (or stdin with `-`) into the knowledge base
    Ingest {
        /// File to ingest, or `-` for stdin
        #[arg(required_unless_present = "text")]
        file: Option<String>,
        /// Ingest this literal text instead of reading a file
        #[arg(short, long, conflicts_with = "file")]
        text: Option<String>,
        /// Source label stored with the document
        #[arg(short, long)]
        source: Option<String>,
    },
    /// Ask a single stateless question
    Query {
        question: String,
        /// Number of sources to return
        #[arg(short, long)]
        k: Option<usize>,
        /// Restrict retrieval to one document id
        #[arg(short, long)]
        document: Option<String>,
        /// Print the full response as JSON
        #[arg(long)]
        json: bool,
    },
    /// Ask a question within a conversational session
    Navigate {
        question: String,
        /// Session id; a new session is created when omitted
        #[arg(short, long)]
        session: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show knowledge-base statistics
    Stats,
    /// Delete a document and its entity-graph entries
    Delete { document_id: String },
    /// Remove sessions idle past their TTL
    Sweep,
    /// Run the HTTP API server
    Serve {
        /// Override the configured bind address
        #[arg(short, long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "recall=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            if let Some(parent) = config.db.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            let engine = QueryEngine::init(config).await?;
            println!("Database initialized.");
            engine.close().await;
        }
        Commands::Ingest { file, text, source } => {
            let (text, label) = match (text, file.as_deref()) {
                (Some(text), _) => (text, "cli".to_string()),
                (None, Some("-")) => {
                    (std::io::read_to_string(std::io::stdin())?, "stdin".to_string())
                }
                (None, Some(file)) => (std::fs::read_to_string(file)?, file.to_string()),
                (None, None) => unreachable!("clap enforces file or --text"),
            };
            let source = source.unwrap_or(label);

            let engine = QueryEngine::init(config).await?;
            let report = engine.ingest_text(&text, &source).await?;
            println!(
                "Ingested {} ({}): {} fragment(s), {} entity mention(s)",
                report.document_id, report.source, report.fragments_created, report.entities_found
            );
            engine.close().await;
        }
        Commands::Query {
            question,
            k,
            document,
            json,
        } => {
            let engine = QueryEngine::init(config).await?;
            let opts = QueryOptions {
                k,
                doc_filter: document,
                timeout: None,
            };
            let response = engine.query(&question, &opts).await?;
            print_response(&response, json)?;
            engine.close().await;
        }
        Commands::Navigate {
            question,
            session,
            json,
        } => {
            let engine = QueryEngine::init(config).await?;
            let response = engine
                .navigate(&question, session.as_deref(), &QueryOptions::default())
                .await?;
            print_response(&response, json)?;
            engine.close().await;
        }
        Commands::Stats => {
            let engine = QueryEngine::init(config).await?;
            let stats = engine.stats().await?;
            println!("Documents: {}", stats.documents);
            println!("Fragments: {}", stats.fragments);
            println!("Entities:  {}", stats.entities);
            println!("Relations: {}", stats.relations);
            println!("Sessions:  {}", stats.sessions);
            engine.close().await;
        }
        Commands::Delete { document_id } => {
            let engine = QueryEngine::init(config).await?;
            let removed = engine.delete_document(&document_id).await?;
            if removed == 0 {
                println!("No document with id '{}'", document_id);
            } else {
                println!("Deleted {} ({} fragment(s))", document_id, removed);
            }
            engine.close().await;
        }
        Commands::Sweep => {
            let engine = QueryEngine::init(config).await?;
            let removed = engine.sessions().sweep_expired().await?;
            println!("Removed {} expired session(s)", removed);
            engine.close().await;
        }
        Commands::Serve { bind } => {
            let addr = bind.unwrap_or_else(|| config.server.bind.clone());
            let engine = QueryEngine::init(config).await?;
            recall::server::serve(engine, &addr).await?;
        }
    }

    Ok(())
}

fn print_response(response: &recall::models::QueryResponse, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(response)?);
        return Ok(());
    }

    println!("{}", response.answer);

    if let Some(session_id) = &response.session_id {
        println!("\nSession: {}", session_id);
    }

    if !response.sources.is_empty() {
        println!("\nSources:");
        for (i, source) in response.sources.iter().enumerate() {
            println!(
                "  {}. {} ({:.2})",
                i + 1,
                source.fragment_id,
                source.score
            );
        }
    }

    if !response.entities.is_empty() {
        let names: Vec<&str> = response.entities.iter().map(|e| e.name.as_str()).collect();
        println!("\nEntities: {}", names.join(", "));
    }

    Ok(())
}
