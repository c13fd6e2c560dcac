// src/bin/inspect.rs
// ============================================================================
// SAFETENSORS INSPECTOR - Header, dtypes, tensores y metadata
// ============================================================================
//
// Uso: halfcast-inspect model.safetensors [--tensors] [--metadata]
//
// ============================================================================

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use halfcast::builder::{CONVERTED_BY_KEY, TARGET_DTYPE_KEY};
use halfcast::inspect::{format_size, histogram, summarize};
use halfcast::SafetensorFile;

#[derive(Parser)]
#[command(name = "halfcast-inspect")]
#[command(about = "Inspect a safetensors file")]
struct Args {
    /// .safetensors file to inspect
    file: PathBuf,

    /// List every tensor
    #[arg(long)]
    tensors: bool,

    /// Show __metadata__
    #[arg(long)]
    metadata: bool,
}

fn make_bar(count: usize, max: usize, width: usize) -> String {
    if max == 0 || count == 0 {
        "░".repeat(width)
    } else {
        let filled = ((count as f64 / max as f64) * width as f64) as usize;
        // Mínimo 1 bloque si hay tensores
        let filled = filled.max(1);
        "█".repeat(filled) + &"░".repeat(width.saturating_sub(filled))
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let file_size = std::fs::metadata(&args.file)
        .with_context(|| format!("Cannot open {}", args.file.display()))?
        .len();
    let file = SafetensorFile::open(&args.file)?;

    println!();
    println!("════════════════════════════════════════════════════════════════════════════════");
    println!("  SAFETENSORS INSPECTOR");
    println!("════════════════════════════════════════════════════════════════════════════════");
    println!("  Archivo:      {}", args.file.display());
    println!("  Tamaño real:  {}", format_size(file_size));
    println!("  Header:       {}", format_size(file.header_len() as u64));
    println!("  Datos:        {}", format_size(file.data_len() as u64));
    println!("  Tensores:     {}", file.tensor_entries().len());

    let meta = file.metadata();
    if let Some(by) = meta.get(CONVERTED_BY_KEY) {
        println!(
            "  Convertido:   {} ({})",
            meta.get(TARGET_DTYPE_KEY).map(String::as_str).unwrap_or("?"),
            by
        );
    }
    println!();

    // ═══════════════════════════════════════════════════════════════
    // DTYPES
    // ═══════════════════════════════════════════════════════════════
    let counts = histogram(&file);
    let max = counts.values().copied().max().unwrap_or(0);

    println!("┌──────────────────────────────────────────────────────────────────────────────┐");
    println!("│ DTYPES                                                                       │");
    println!("├──────────────────────────────────────────────────────────────────────────────┤");
    if counts.is_empty() {
        println!("│  (sin tensores)                                                              │");
    }
    for (dtype, count) in &counts {
        println!("│  {:8} {} {:>8}                                         │", dtype, make_bar(*count, max, 25), count);
    }
    println!("└──────────────────────────────────────────────────────────────────────────────┘");
    println!();

    // ═══════════════════════════════════════════════════════════════
    // TENSORES (opcional)
    // ═══════════════════════════════════════════════════════════════
    if args.tensors {
        println!("┌──────────────────────────────────────────────────────────────────────────────┐");
        println!("│ TENSORES                                                                     │");
        println!("├──────────────────────────────────────────────────────────────────────────────┤");
        for t in summarize(&file) {
            println!(
                "│  {:44} {:8} {:16} {:>10} │",
                t.name,
                t.dtype.as_str(),
                format!("{:?}", t.shape),
                format_size(t.bytes)
            );
        }
        println!("└──────────────────────────────────────────────────────────────────────────────┘");
        println!();
    }

    // ═══════════════════════════════════════════════════════════════
    // METADATA (opcional)
    // ═══════════════════════════════════════════════════════════════
    if args.metadata {
        println!("┌──────────────────────────────────────────────────────────────────────────────┐");
        println!("│ METADATA                                                                     │");
        println!("├──────────────────────────────────────────────────────────────────────────────┤");
        if meta.is_empty() {
            println!("│  (vacía)                                                                     │");
        }
        for (key, value) in meta {
            println!("│  {:28} {:47} │", key, value);
        }
        println!("└──────────────────────────────────────────────────────────────────────────────┘");
    }

    Ok(())
}
