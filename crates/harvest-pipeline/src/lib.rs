//! Harvest Pipeline Library
//!
//! Incremental harvesting of records from a paginated JSON:API source into a downstream
//! document store, through durable queues with a fixed retry chain.
//!
//! # Overview
//!
//! - **Identify** ([`stages::IdentifyStage`]): select records changed since the last run,
//!   promote them to their highest accessible ancestor, enqueue for transform
//! - **Transform** ([`stages::TransformStage`]): build canonical documents, forward to ingest
//! - **Ingest** ([`stages::IngestStage`]): publish only documents that changed
//! - **Queues** ([`queue`]): durable named queues and the drain consumer
//! - **Driver** ([`driver::HarvestDriver`]): walks the retry chains once per cycle
//!
//! Every stage routes a failing message one tier along
//! `none -> retry1 -> retry2 -> retry3 -> fail`; `requeuefails` moves `fail` back to the
//! primary queue.

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod document;
pub mod driver;
pub mod error;
pub mod filters;
pub mod model;
pub mod queue;
pub mod registry;
pub mod source;
pub mod stages;
pub mod store;

// Re-export commonly used types
pub use config::HarvestConfig;
pub use driver::{HarvestDriver, HarvestReport, Process};
pub use error::{PipelineError, Result};
pub use filters::FilterParams;
pub use model::RecordKind;

use clap::Parser;

/// Harvester - incremental record harvest, transform and ingest
#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Record type to harvest
    #[arg(short = 't', long = "type", value_enum, default_value_t = RecordKind::Node)]
    pub kind: RecordKind,

    /// Process to run against the selected type. `identify` lists changed records onto
    /// the transform queue; `transform` and `ingest` walk their retry chains; `all` runs
    /// all three; `requeuefails` moves both fail queues back to their primary queues.
    #[arg(short, long, value_enum, default_value_t = Process::All)]
    pub process: Process,

    /// Listing filters in query-string form, e.g. "filter[date_modified][gte]=2024-01-01".
    /// Only applies to identify. Without a date filter the run covers changes since the
    /// last run.
    #[arg(short, long, default_value = "")]
    pub filters: String,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}
