//! Command-line front end: AIM images in, solver deck out.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use bone_hfe::{run_pipeline, write_boundary_conditions, HfeConfig, LogProgress, SpecimenInputs, SpecimenPaths};
use clap::{Args, Parser, Subcommand};
use nalgebra::Vector3;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Homogenized finite-element preprocessing of bone micro-CT scans
#[derive(Parser)]
#[command(name = "hfe_preprocess")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Bone micro-CT to homogenized hexahedral model", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Preprocess one specimen
    Run(RunArgs),
    /// Check a configuration file and print its summary
    Validate {
        /// TOML configuration
        config: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// TOML configuration; defaults apply when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Grayscale density image
    #[arg(long)]
    density: PathBuf,
    /// Bone segmentation image
    #[arg(long)]
    segmentation: PathBuf,
    /// Cortical compartment mask
    #[arg(long)]
    cortical: PathBuf,
    /// Trabecular compartment mask
    #[arg(long)]
    trabecular: PathBuf,
    /// Optional common-region mask applied to every image
    #[arg(long)]
    common_region: Option<PathBuf>,
    /// Voxel spacing (mm) for images whose log carries no dimensions
    #[arg(long, default_value_t = 0.0607)]
    spacing: f64,
    /// Output deck
    #[arg(short, long, default_value = "model.inp")]
    output: PathBuf,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<HfeConfig> {
    match path {
        Some(p) => HfeConfig::from_file(p).with_context(|| format!("loading configuration {}", p.display())),
        None => Ok(HfeConfig::default()),
    }
}

fn write_file(path: &Path, f: impl FnOnce(&mut BufWriter<File>) -> bone_hfe::HfeResult<()>) -> anyhow::Result<()> {
    let mut writer = BufWriter::new(File::create(path).with_context(|| format!("creating {}", path.display()))?);
    f(&mut writer).with_context(|| format!("writing {}", path.display()))?;
    writer.flush()?;
    Ok(())
}

fn run(args: RunArgs) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;
    for line in config.summary_lines() {
        info!("{line}");
    }

    let paths = SpecimenPaths {
        density: args.density,
        segmentation: args.segmentation,
        cortical_mask: args.cortical,
        trabecular_mask: args.trabecular,
        common_region: args.common_region,
    };
    let spacing = Vector3::new(args.spacing, args.spacing, args.spacing);
    let inputs = SpecimenInputs::load(&paths, spacing).context("decoding specimen images")?;

    let output = run_pipeline(&inputs, &config, &LogProgress).context("preprocessing specimen")?;
    for line in output.summary.lines() {
        info!("{line}");
    }

    write_file(&args.output, |w| output.deck.write(w))?;
    info!(path = %args.output.display(), "Deck written");

    if let Some(displacement) = config.deck.reference_displacement_mm {
        let bc_path = args
            .output
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&config.deck.boundary_conditions_file);
        write_file(&bc_path, |w| write_boundary_conditions(w, displacement))?;
        info!(path = %bc_path.display(), "Boundary conditions written");
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Validate { config } => {
            let config = load_config(Some(&config))?;
            for line in config.summary_lines() {
                info!("{line}");
            }
            Ok(())
        }
    }
}
