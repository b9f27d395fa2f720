use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ocp_mt::training::loss::MultiTaskLoss;
use ocp_mt::training::normalizer::NormalizerSet;
use ocp_mt::TrainerConfig;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser)]
#[command(name = "ocp-mt")]
#[command(about = "Multi-task loss and metric core for atomistic GNN training", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a multi-task configuration file
    Check {
        /// Configuration file (JSON, YAML or TOML)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Show build information
    Info,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.json);

    match cli.command {
        Commands::Check { config } => check_config(config)?,
        Commands::Info => show_info(),
    }

    Ok(())
}

fn init_logging(verbosity: u8, json_output: bool) {
    let default_filter = match verbosity {
        0 => "ocp_mt=info",
        1 => "ocp_mt=debug,info",
        _ => "ocp_mt=trace,debug",
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    if json_output {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(json_layer).init();
    } else {
        let fmt_layer = fmt::layer().with_target(false).with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).init();
    }
}

fn check_config(config_path: PathBuf) -> Result<()> {
    info!("Validating configuration file: {}", config_path.display());

    let config = TrainerConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;
    let loss = MultiTaskLoss::new(&config).context("Failed to resolve loss terms")?;
    let normalizers = NormalizerSet::from_config(&config.normalizers, config.num_tasks())
        .context("Failed to build normalizers")?;

    info!("Configuration is valid");
    info!(
        "  - Tasks: {}",
        config
            .mt
            .tasks_by_idx()
            .iter()
            .map(|task| format!("{}={}", task.idx, task.name))
            .collect::<Vec<_>>()
            .join(", ")
    );
    for (target, head) in &config.outputs {
        info!(
            "  - Output '{}': {:?} level, free atoms only: {}",
            target,
            head.level,
            head.trains_on_free_atoms()
        );
    }
    for term in loss.terms() {
        info!(
            "  - Loss '{}': {:?}, {} reduction, coefficient {}, per-task {:?}",
            term.target(),
            term.loss_kind(),
            term.reduction().as_str(),
            term.coefficient(),
            term.coefficients().values()
        );
    }
    info!("  - Normalizers: {}", normalizers.len());
    info!("  - Print every: {} steps", config.print_every);

    Ok(())
}

fn show_info() {
    println!("OCP-MT - multi-task loss and metric core");
    println!();
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Tensor backends:");

    #[cfg(feature = "cuda")]
    println!("  [x] NVIDIA CUDA");
    #[cfg(not(feature = "cuda"))]
    println!("  [ ] NVIDIA CUDA (not compiled)");

    #[cfg(feature = "metal")]
    println!("  [x] Apple Metal");
    #[cfg(not(feature = "metal"))]
    println!("  [ ] Apple Metal (not compiled)");

    #[cfg(feature = "accelerate")]
    println!("  [x] Apple Accelerate");
    #[cfg(not(feature = "accelerate"))]
    println!("  [ ] Apple Accelerate (not compiled)");

    println!("  [x] CPU");
    println!();
    println!("Usage:");
    println!("  ocp-mt check -c mt.yaml   # Validate a configuration");
    println!("  ocp-mt info               # Show this information");
}
