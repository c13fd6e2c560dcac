// src/main.rs
// ============================================================================
// HALFCAST CLI
// ============================================================================
//
// Uso:
//   halfcast --in model.safetensors --out model-fp16.safetensors --to fp16
//   halfcast --in ./Qwen2-7B --out ./Qwen2-7B-bf16 --to bf16 -j 8 --verify
//   halfcast --in ./Qwen2-7B/model.safetensors.index.json --out ./out --to fp16
//
// Diagnóstico:
//   halfcast dtypes model.safetensors      -> {"BF16":290,"I64":1}
//
// ============================================================================

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};

use halfcast::{
    atomic,
    dispatch::{classify, convert_path},
    inspect::{dtype_histogram, format_histogram, format_size},
    ConvertError, ConvertOptions, TargetDtype,
};

#[derive(Parser, Debug)]
#[command(name = "halfcast")]
#[command(about = "Convert safetensors checkpoints between BF16 and FP16")]
#[command(version)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Input .safetensors file, index.json, or folder
    #[arg(long = "in", value_name = "PATH")]
    input: Option<PathBuf>,

    /// Output file or folder
    #[arg(long = "out", value_name = "PATH")]
    output: Option<PathBuf>,

    /// Target dtype: bf16 or fp16
    #[arg(long = "to", value_name = "DTYPE")]
    to: Option<TargetDtype>,

    /// Convert shards in parallel with N threads
    #[arg(short, long, value_name = "N")]
    jobs: Option<usize>,

    /// Re-open every output and check it against its input
    #[arg(long)]
    verify: bool,

    /// No banners, no progress
    #[arg(short, long)]
    quiet: bool,

    /// More logging (-v info, -vv debug)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print how many tensors of each dtype a .safetensors file holds
    Dtypes {
        /// .safetensors file
        path: PathBuf,
    },
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp(None)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    if let Err(e) = atomic::install_interrupt_handler() {
        log::warn!("cannot install Ctrl-C handler: {}", e);
    }

    if let Err(e) = run(cli) {
        eprintln!("[ERROR] {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    if let Some(Command::Dtypes { path }) = &cli.command {
        let counts = dtype_histogram(path)
            .with_context(|| format!("cannot read dtypes of {}", path.display()))?;
        println!("{}", format_histogram(&counts));
        return Ok(());
    }

    let (input, output, target) = match (cli.input, cli.output, cli.to) {
        (Some(i), Some(o), Some(t)) => (i, o, t),
        _ => {
            return Err(ConvertError::InvalidInput(
                "--in, --out and --to are required (or use the `dtypes` subcommand)".to_string(),
            )
            .into())
        }
    };

    let mut opts = ConvertOptions::new(target)
        .with_verify(cli.verify)
        .with_progress(!cli.quiet);
    if let Some(jobs) = cli.jobs {
        opts = opts.with_jobs(jobs);
    }

    let kind = classify(&input)?;
    let start = Instant::now();

    if !cli.quiet {
        println!("═══════════════════════════════════════════════════════════════");
        println!("  HALFCAST v{} - Safetensors BF16 <-> FP16", env!("CARGO_PKG_VERSION"));
        println!("═══════════════════════════════════════════════════════════════");
        println!("  Input:   {} ({:?})", input.display(), kind);
        println!("  Output:  {}", output.display());
        println!("  Target:  {}", target);
        println!("  Jobs:    {}", opts.jobs.unwrap_or(1));
        println!("  Verify:  {}", if opts.verify { "ON" } else { "OFF" });
        println!("═══════════════════════════════════════════════════════════════");
    }

    let stats = convert_path(&input, &output, &opts)?;

    if !cli.quiet {
        println!();
        println!("═══════════════════════════════════════════════════════════════");
        println!("  DONE in {:.1}s", start.elapsed().as_secs_f64());
        println!("═══════════════════════════════════════════════════════════════");
        println!("  Files:        {}", stats.files);
        println!("  Tensors:      {} ({} converted, {} copied)",
            stats.total_tensors(), stats.converted_count, stats.passthrough_count);
        println!("  Data in:      {}", format_size(stats.bytes_in));
        println!("  Data out:     {}", format_size(stats.bytes_out));
        println!("═══════════════════════════════════════════════════════════════");
    }

    Ok(())
}
