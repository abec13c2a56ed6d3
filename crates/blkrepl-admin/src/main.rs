#![warn(missing_docs)]

//! blkrepl command line tool

mod cli;
mod simulate;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with((!cli.json).then(fmt::layer))
        .with(cli.json.then(|| fmt::layer().json()))
        .with(EnvFilter::from_default_env())
        .init();

    tracing::debug!(command = ?cli.command, "blkrepl starting");
    cli.run().await
}
