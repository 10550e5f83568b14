use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use w3jobs_aggregate::{run_with_config, AggregatorConfig, SourceRegistry};
use w3jobs_web::ResultDocument;

#[derive(Debug, Parser)]
#[command(name = "w3jobs")]
#[command(about = "Web3 job listings aggregator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Aggregate every enabled source, optionally filtered by keywords.
    Search {
        /// Keyword a listing must contain; repeatable, all must match.
        #[arg(short, long = "keyword")]
        keywords: Vec<String>,
        /// Emit the full result document as JSON instead of a summary.
        #[arg(long)]
        json: bool,
    },
    /// List the source catalog.
    Sources,
    /// Run the HTTP API.
    Serve {
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Search {
        keywords: Vec::new(),
        json: false,
    }) {
        Commands::Search { keywords, json } => {
            let registry = load_registry()?;
            let config = AggregatorConfig::from_env();
            let keyword_slice = (!keywords.is_empty()).then_some(keywords.as_slice());
            let result = run_with_config(registry.list(), keyword_slice, &config).await?;
            let doc = ResultDocument::from_result(result);
            if json {
                println!("{}", serde_json::to_string_pretty(&doc)?);
            } else {
                println!("{} listings from {} sources", doc.total, doc.sources.len());
                for row in &doc.sources {
                    println!("  {:>5}  {}", row.count, row.source);
                }
            }
        }
        Commands::Sources => {
            let registry = load_registry()?;
            for source in registry.list() {
                let status = if source.enabled { "enabled" } else { "disabled" };
                println!("{:<22} {:<10} {}", source.id, status, source.display_name);
            }
        }
        Commands::Serve { port } => {
            w3jobs_web::serve(port).await?;
        }
    }

    Ok(())
}

/// Builtin catalog plus optional `sources.yaml` overrides from the
/// working directory.
fn load_registry() -> Result<SourceRegistry> {
    let mut registry = SourceRegistry::builtin();
    if let Ok(yaml) = std::fs::read_to_string("sources.yaml") {
        registry.apply_overrides_yaml(&yaml)?;
    }
    Ok(registry)
}
