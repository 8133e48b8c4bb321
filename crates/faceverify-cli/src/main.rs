use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use faceverify_core::{FaceService, Strategy};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod config;

#[derive(Parser)]
#[command(name = "faceverify", about = "Face detection, embedding and verification")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory containing the ONNX models
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,
    /// Pipeline strategy (cascade, heuristic, mock)
    #[arg(long, global = true)]
    strategy: Option<Strategy>,
    /// Never fall back from the cascade to the heuristic detector
    #[arg(long, global = true)]
    cascade_only: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect faces in an image
    Detect {
        image: PathBuf,
    },
    /// Detect the best face and print its embedding
    Embed {
        image: PathBuf,
    },
    /// Verify whether two images show the same person
    Compare {
        a: PathBuf,
        b: PathBuf,
        /// Match threshold, overriding the configured one
        #[arg(short, long)]
        threshold: Option<f32>,
    },
    /// Load models and show the effective pipeline
    Status,
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::load(
        cli.config.as_deref(),
        config::Overrides {
            model_dir: cli.model_dir,
            strategy: cli.strategy,
            cascade_only: cli.cascade_only,
        },
    )?;
    tracing::debug!(model_dir = %config.models.dir.display(), strategy = %config.strategy, "configuration loaded");
    let service = FaceService::new(config);

    match cli.command {
        Commands::Detect { image } => {
            let detection = service.detect(read_image(&image)?).await?;
            print_json(&detection)?;
        }
        Commands::Embed { image } => {
            let analysis = service.analyze(read_image(&image)?).await?;
            print_json(&analysis)?;
        }
        Commands::Compare { a, b, threshold } => {
            let result = service.compare(read_image(&a)?, read_image(&b)?, threshold).await?;
            print_json(&result)?;
        }
        Commands::Status => {
            let status = service.warm_up().await?;
            print_json(&status)?;
        }
    }

    Ok(())
}
