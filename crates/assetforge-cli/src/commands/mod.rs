//! CLI command implementations.

pub mod jobs;
pub mod queues;

use anyhow::Result;
use assetforge_config::load_from_path;

pub fn validate(path: &str) -> Result<()> {
    match load_from_path(path) {
        Ok(config) => {
            println!("Configuration is valid");
            println!("  providers: {}", config.providers.len());
            for queue in &config.queues {
                println!(
                    "  {}: concurrency {}, failover [{}]",
                    queue.name,
                    queue.concurrency,
                    queue.providers.join(", ")
                );
            }
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
