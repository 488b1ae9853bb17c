//! Scenic quality command line: runs the model from a JSON config and moves
//! rasters in and out of GeoTIFF.
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use scenic_core::{DiskVisibility, ModelConfig};

mod geotiff;
mod render;

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "scenic-quality", about = "Visibility, valuation and visual quality of structures over a DEM")]
struct Cli {
    /// Debug-level logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the model described by a JSON config
    Run {
        /// Model config (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Worker threads; 0 runs tasks synchronously
        #[arg(long)]
        workers: Option<usize>,

        /// Override the config's workspace directory
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
    /// Convert a single-band GeoTIFF DEM into a scenic raster
    ImportDem {
        input: PathBuf,
        output: PathBuf,

        /// Storage block edge in pixels
        #[arg(long, default_value = "256")]
        block: usize,
    },
    /// Write a scenic raster as a Float32 GeoTIFF
    Export { input: PathBuf, output: PathBuf },
    /// Render a visual-quality raster as a PNG quicklook
    Render { input: PathBuf, output: PathBuf },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

// ── Entry point ──────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Run { config, workers, workspace } => run(config, workers, workspace),
        Command::ImportDem { input, output, block } => {
            let info = geotiff::import_dem(&input, &output, block)
                .with_context(|| format!("importing {}", input.display()))?;
            tracing::info!("Wrote {} ({}x{}, nodata {:?})", output.display(), info.width, info.height, info.nodata);
            Ok(())
        }
        Command::Export { input, output } => {
            geotiff::export(&input, &output).with_context(|| format!("exporting {}", input.display()))?;
            tracing::info!("Wrote {}", output.display());
            Ok(())
        }
        Command::Render { input, output } => {
            render::render_quality(&input, &output).with_context(|| format!("rendering {}", input.display()))?;
            tracing::info!("Wrote {}", output.display());
            Ok(())
        }
    }
}

fn run(config_path: PathBuf, workers: Option<usize>, workspace: Option<PathBuf>) -> Result<()> {
    let mut config = ModelConfig::from_json_file(&config_path)
        .with_context(|| format!("reading config {}", config_path.display()))?;
    if let Some(n) = workers {
        config.n_workers = n;
    }
    if let Some(ws) = workspace {
        config.workspace_dir = ws;
    }

    let outputs = scenic_core::execute(&config, Arc::new(DiskVisibility)).context("scenic quality model failed")?;
    println!("{}", serde_json::to_string_pretty(&outputs.files)?);
    Ok(())
}
