//! egressos CLI: registry preparation and alumni founder/partner enrichment.
//!
//! Downloads the partner ("Socios") archives of the public CNPJ registry,
//! normalizes them into pseudonymized datasets and joins them against the
//! alumni roster.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
