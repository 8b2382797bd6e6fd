//! Harvester - main entry point

use anyhow::Context;
use clap::Parser;
use harvest_common::logging::{init_logging, LogConfig, LogLevel, LogOutput};
use harvest_pipeline::{Cli, FilterParams, HarvestConfig, HarvestDriver, HarvestReport};
use std::process;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .output(LogOutput::Console)
        .log_file_prefix("harvester")
        .build();

    // Environment variables take precedence
    let log_config = match log_config.clone().merge_env() {
        Ok(merged) => merged,
        Err(e) => {
            eprintln!("Warning: ignoring LOG_* settings: {}", e);
            log_config
        }
    };
    let guard = match init_logging(&log_config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {}", e);
            None
        }
    };

    if let Err(e) = run(&cli).await {
        error!(error = %e, "Harvest failed");
        eprintln!("Error: {:#}", e);
        // exit() skips destructors; flush buffered file logs first
        drop(guard);
        process::exit(1);
    }
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    let filters = FilterParams::parse(&cli.filters).context("Invalid --filters value")?;
    let config = HarvestConfig::from_env().context("Failed to load configuration")?;

    info!(
        kind = %cli.kind,
        process = ?cli.process,
        filters = %cli.filters,
        "Starting harvester"
    );

    let driver = HarvestDriver::connect(&config)
        .await
        .context("Failed to initialise pipeline")?;
    let report = driver.run(cli.kind, cli.process, &filters).await?;

    print_summary(cli, &report);
    Ok(())
}

fn print_summary(cli: &Cli, report: &HarvestReport) {
    let kind = cli.kind;
    if let Some(identified) = &report.identified {
        println!("Number of {}s identified for harvest: {}", kind, identified.enqueued);
    }
    if let Some(transformed) = &report.transformed {
        println!(
            "Number of {}s processed from transform queues: {}",
            kind, transformed.processed
        );
    }
    if let Some(ingested) = &report.ingested {
        println!(
            "Number of {}s processed from ingest queues: {}",
            kind, ingested.processed
        );
    }
    if let Some(requeued) = &report.requeued {
        println!(
            "Number of failed {} transforms identified and requeued for harvest: {}",
            kind, requeued.transform
        );
        println!(
            "Number of failed {} ingests identified and requeued for harvest: {}",
            kind, requeued.ingest
        );
    }
    println!("Harvest process completed!");
}
