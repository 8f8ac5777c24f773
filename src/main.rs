use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use sensorbench::{ComparisonPipeline, Config, Storage};

#[derive(Parser, Debug)]
#[command(name = "sensorbench")]
#[command(version = "0.1.0")]
#[command(about = "Compare LLM sensor knowledge by generating and reviewing datasheets")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    config: std::path::PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate datasheets for every configured sensor with every model
    Generate,
    /// Review generated datasheets against the official ones
    Review {
        /// Model id (from the config) to review with
        #[arg(long)]
        reviewer: String,
        /// Send the whole review as one request instead of three chunks
        #[arg(long)]
        single: bool,
    },
    /// Print per-reviewer score averages from the database
    Summary,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("sensorbench=info".parse()?)
                .add_directive("reqwest=warn".parse()?),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = Config::load(&args.config)?;
    let storage = Storage::new(&config.database_path)?;

    match args.command {
        Command::Generate => {
            let pipeline = ComparisonPipeline::new(config, storage)?;
            pipeline.generate_all().await?;
        }
        Command::Review { reviewer, single } => {
            let entry = config
                .models
                .iter()
                .find(|model| model.id == reviewer)
                .cloned()
                .ok_or_else(|| {
                    anyhow::anyhow!("reviewer model '{}' is not in the configuration", reviewer)
                })?;
            let pipeline = ComparisonPipeline::new(config, storage)?;
            pipeline.review_all(&entry, !single).await?;
        }
        Command::Summary => {
            for row in storage.review_summary()? {
                match row.average_score {
                    Some(avg) => println!(
                        "{}: {} reviews, average score {:.2}",
                        row.reviewer_model, row.reviews, avg
                    ),
                    None => println!(
                        "{}: {} reviews, no numeric scores",
                        row.reviewer_model, row.reviews
                    ),
                }
            }
        }
    }

    Ok(())
}
