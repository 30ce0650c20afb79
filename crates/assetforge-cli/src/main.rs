//! assetforge CLI tool.

use assetforge_core::generation::{AssetFormat, AssetType, QualityLevel, StyleType};
use assetforge_core::job::{JobStatus, Priority, QueueName};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod client;
mod commands;

use client::ApiClient;

#[derive(Parser)]
#[command(name = "assetforge")]
#[command(about = "Asset generation job CLI", long_about = None, version)]
struct Cli {
    /// API server URL
    #[arg(long, env = "ASSETFORGE_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    /// Identity sent as the job owner
    #[arg(long, env = "ASSETFORGE_USER", default_value = "cli")]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a job
    Submit {
        #[command(subcommand)]
        job: SubmitCommands,
    },
    /// Show job status
    Status {
        queue: QueueName,
        id: String,
        /// Poll until the job reaches a terminal state
        #[arg(short, long)]
        follow: bool,
        /// Poll interval, e.g. 500ms or 2s
        #[arg(long, default_value = "1s")]
        interval: String,
    },
    /// Cancel a pending or processing job
    Cancel { queue: QueueName, id: String },
    /// List jobs in a queue, newest first
    List {
        queue: QueueName,
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        offset: Option<u32>,
        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Show per-status job counts
    Stats { queue: QueueName },
    /// List jobs that failed for good
    Failed {
        queue: QueueName,
        #[arg(long)]
        owner: Option<String>,
        #[arg(long, default_value = "100")]
        limit: u32,
    },
    /// Remove finished jobs older than a given age
    Cleanup {
        queue: QueueName,
        /// Maximum age, e.g. 1h; defaults to the server's retention
        #[arg(long)]
        max_age: Option<String>,
    },
    /// Validate a server configuration file
    Validate {
        /// Path to the configuration file
        #[arg(default_value = assetforge_config::DEFAULT_CONFIG_PATH)]
        path: String,
    },
}

#[derive(Subcommand)]
enum SubmitCommands {
    /// Generate assets from a prompt
    Generate {
        prompt: String,
        #[arg(long, default_value = "prop-design")]
        asset_type: AssetType,
        #[arg(long)]
        style: Option<StyleType>,
        #[arg(long)]
        quality: Option<QualityLevel>,
        #[arg(long)]
        format: Option<AssetFormat>,
        #[arg(long)]
        negative_prompt: Option<String>,
        #[arg(long)]
        width: Option<u32>,
        #[arg(long)]
        height: Option<u32>,
        #[arg(long)]
        count: Option<u32>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        priority: Option<Priority>,
        /// Hold the job back this many seconds
        #[arg(long)]
        delay: Option<u32>,
    },
    /// Train a style pack from reference images
    StylePack {
        name: String,
        /// Reference image URIs (5 to 100)
        #[arg(long = "image", required = true)]
        images: Vec<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        steps: Option<u32>,
        #[arg(long)]
        resolution: Option<u32>,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        priority: Option<Priority>,
        /// Hold the job back this many seconds
        #[arg(long)]
        delay: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let client = ApiClient::new(&cli.api_url, &cli.user)?;

    match cli.command {
        Commands::Submit { job } => match job {
            SubmitCommands::Generate {
                prompt,
                asset_type,
                style,
                quality,
                format,
                negative_prompt,
                width,
                height,
                count,
                seed,
                project,
                priority,
                delay,
            } => {
                let body = commands::jobs::GenerateArgs {
                    prompt,
                    asset_type,
                    style,
                    quality,
                    format,
                    negative_prompt,
                    width,
                    height,
                    count,
                    seed,
                    project,
                    priority,
                    delay,
                }
                .to_body();
                commands::jobs::submit(&client, QueueName::AssetGeneration, &body).await?;
            }
            SubmitCommands::StylePack {
                name,
                images,
                description,
                steps,
                resolution,
                project,
                priority,
                delay,
            } => {
                let body = commands::jobs::StylePackArgs {
                    name,
                    images,
                    description,
                    steps,
                    resolution,
                    project,
                    priority,
                    delay,
                }
                .to_body();
                commands::jobs::submit(&client, QueueName::StylePackTraining, &body).await?;
            }
        },
        Commands::Status {
            queue,
            id,
            follow,
            interval,
        } => {
            let interval = assetforge_config::parse_duration("interval", &interval)?;
            commands::jobs::status(&client, queue, &id, follow.then_some(interval)).await?;
        }
        Commands::Cancel { queue, id } => {
            commands::jobs::cancel(&client, queue, &id).await?;
        }
        Commands::List {
            queue,
            status,
            owner,
            project,
            offset,
            limit,
        } => {
            let filter = commands::jobs::ListArgs {
                status,
                owner,
                project,
                offset,
                limit,
            };
            commands::jobs::list(&client, queue, &filter).await?;
        }
        Commands::Stats { queue } => {
            commands::queues::stats(&client, queue).await?;
        }
        Commands::Failed {
            queue,
            owner,
            limit,
        } => {
            commands::queues::failed(&client, queue, owner, limit).await?;
        }
        Commands::Cleanup { queue, max_age } => {
            let max_age = max_age
                .map(|raw| assetforge_config::parse_duration("max-age", &raw))
                .transpose()?;
            commands::queues::cleanup(&client, queue, max_age).await?;
        }
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
    }

    Ok(())
}
