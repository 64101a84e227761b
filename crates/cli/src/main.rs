use std::path::PathBuf;
use std::process::ExitCode;

use causal_conv_core::conv::Activation;
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};

use causal_conv_cli::checks::{run_check, run_gradcheck, run_stream, CheckReport};
use causal_conv_cli::config::{CheckConfig, CheckParams};
use causal_conv_cli::logging;

#[derive(Parser)]
#[command(name = "causal-conv", about = "Validation harness for the causal conv1d engine")]
struct Cli {
    /// Config file (defaults to ~/.config/causal-conv/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compare the fused engine with the reference engine
    Check(ProblemArgs),
    /// Compare streaming decode and chunked prefill with a one-shot forward
    Stream(ProblemArgs),
    /// Compare backward gradients with finite differences (f64)
    Gradcheck(ProblemArgs),
    /// Write the merged configuration to the config file and exit
    SaveConfig(ProblemArgs),
}

/// Problem overrides; unset values come from the config file, then defaults.
#[derive(Args, Debug, Clone, Default)]
struct ProblemArgs {
    #[arg(long)]
    batch: Option<usize>,
    #[arg(long)]
    dim: Option<usize>,
    #[arg(long)]
    seqlen: Option<usize>,
    /// Filter width (2, 3 or 4).
    #[arg(long)]
    width: Option<usize>,
    /// Signal dtype (f32, f64, f16, bf16).
    #[arg(long)]
    dtype: Option<String>,
    /// Activation (none, silu, swish).
    #[arg(long)]
    activation: Option<Activation>,
    #[arg(long)]
    bias: Option<bool>,
    /// Initial state width; 0 disables it.
    #[arg(long)]
    state_len: Option<usize>,
    /// Segments per batch row; values above 1 enable seq_idx masking.
    #[arg(long)]
    segments: Option<usize>,
    /// Prefilled timesteps before streaming starts (default: min(8, seqlen)).
    #[arg(long)]
    prefill: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
    /// Maximum absolute error (defaults per dtype).
    #[arg(long)]
    tolerance: Option<f64>,
}

impl From<&ProblemArgs> for CheckConfig {
    fn from(args: &ProblemArgs) -> Self {
        CheckConfig {
            batch: args.batch,
            dim: args.dim,
            seqlen: args.seqlen,
            width: args.width,
            dtype: args.dtype.clone(),
            activation: args.activation,
            bias: args.bias,
            state_len: args.state_len,
            segments: args.segments,
            prefill: args.prefill,
            seed: args.seed,
            tolerance: args.tolerance,
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<CheckConfig> {
    match path {
        Some(path) => Ok(CheckConfig::load_from(path)?),
        None => {
            if let Some(path) = CheckConfig::default_path() {
                if path.exists() {
                    eprintln!("Loaded config from: {}", path.display());
                }
            }
            Ok(CheckConfig::load())
        }
    }
}

fn report(reports: &[CheckReport]) -> bool {
    let mut ok = true;
    for r in reports {
        if r.passed() {
            info!(check = r.name, max_abs_diff = r.max_abs_diff, tolerance = r.tolerance, "passed");
        } else {
            error!(check = r.name, max_abs_diff = r.max_abs_diff, tolerance = r.tolerance, "failed");
            ok = false;
        }
        println!("{r}");
    }
    ok
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    logging::init(&cli.log_level)?;

    let mut config = load_config(cli.config.as_ref())?;
    let overrides = match &cli.command {
        Command::Check(a) | Command::Stream(a) | Command::Gradcheck(a) | Command::SaveConfig(a) => {
            CheckConfig::from(a)
        }
    };
    config.merge(&overrides);

    let runner: fn(&CheckParams) -> causal_conv_core::conv::Result<Vec<CheckReport>> =
        match &cli.command {
            Command::Check(_) => run_check,
            Command::Stream(_) => run_stream,
            Command::Gradcheck(_) => run_gradcheck,
            Command::SaveConfig(_) => {
                config.resolve()?;
                let path = match &cli.config {
                    Some(path) => {
                        config.save_to(path)?;
                        path.clone()
                    }
                    None => config.save()?,
                };
                info!(path = %path.display(), "configuration saved");
                return Ok(ExitCode::SUCCESS);
            }
        };

    let params = config.resolve()?;
    info!(?params, "running checks");
    if report(&runner(&params)?) {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
