use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use parcel_reconcile::run::default_date_stamp;
use parcel_reconcile::{config_paths, run_config, VERSION};

/// Run one pipeline config, or every config in a directory (sorted by name)
#[derive(Parser, Debug)]
#[command(name = "parcel-reconcile", version)]
struct Cli {
    /// YAML config file, or a directory of *.yml / *.yaml configs
    path: PathBuf,

    /// Stamp for the `{date}` token of output names (default: now, UTC)
    #[arg(long)]
    date: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let date = cli.date.unwrap_or_else(default_date_stamp);

    let configs = config_paths(&cli.path)?;
    info!("🗺️  parcel-reconcile {} - {} config(s), date {}", VERSION, configs.len(), date);

    for path in &configs {
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        info!("📄 {}", path.display());
        let outcome = run_config(path, &date)?;
        for file in &outcome.written {
            info!("   ✓ {}", file.display());
        }
        if let Some(report) = &outcome.reconciliation {
            info!("   ⚖️  {}", report.summary());
        }
    }

    Ok(())
}
