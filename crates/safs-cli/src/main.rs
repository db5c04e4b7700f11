#![warn(missing_docs)]

//! `safs`: import, list and inspect logical files in a SAFS data root.

mod cli;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = cli.load_config()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.threads)
        .thread_name("safs-worker")
        .enable_all()
        .build()?;

    tracing::info!(
        "SAFS starting: root={}, {} threads, RAID {}",
        config.root_conf.display(),
        config.threads,
        config.raid_mapping
    );
    runtime.block_on(cli.run(config))
}
