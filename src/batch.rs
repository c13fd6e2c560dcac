// src/batch.rs
// ============================================================================
// BATCH - Convierte una lista de shards (secuencial o con rayon)
// ============================================================================
//
// Cada shard es una función pura de su archivo de entrada, así que el
// orden de conversión no es observable. Las rutas de salida deben ser
// distintas entre sí.
//
// ============================================================================

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;

use crate::builder::{convert_file, ConvertStats};
use crate::config::ConvertOptions;
use crate::error::{ConvertError, Result};

/// (entrada, salida)
pub type Job = (PathBuf, PathBuf);

fn progress_bar(len: usize, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::with_template("  [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓░"),
    );
    pb
}

fn run_one(src: &Path, dst: &Path, opts: &ConvertOptions, pb: &ProgressBar) -> Result<ConvertStats> {
    let stats = convert_file(src, dst, opts)?;
    pb.inc(1);
    pb.println(format!(
        "[OK] {}  ->  {}",
        src.file_name().unwrap_or_default().to_string_lossy(),
        dst.display()
    ));
    Ok(stats)
}

/// Convierte todos los jobs. Aborta en el primer error; lo ya escrito se queda.
pub fn convert_batch(jobs: &[Job], opts: &ConvertOptions) -> Result<ConvertStats> {
    let mut seen = HashSet::with_capacity(jobs.len());
    for (_, dst) in jobs {
        if !seen.insert(dst) {
            return Err(ConvertError::InvalidInput(format!(
                "two shards would be written to {}",
                dst.display()
            )));
        }
    }

    let pb = progress_bar(jobs.len(), opts.progress);
    // Las líneas [OK] salen por la barra
    let per_file = opts.clone().with_progress(false);

    let parts: Vec<ConvertStats> = match opts.jobs.filter(|_| opts.parallel()) {
        Some(threads) => {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .map_err(|e| ConvertError::InvalidInput(format!("cannot start {} workers: {}", threads, e)))?;
            pool.install(|| {
                jobs.par_iter()
                    .map(|(src, dst)| run_one(src, dst, &per_file, &pb))
                    .collect::<Result<Vec<_>>>()
            })?
        }
        None => jobs
            .iter()
            .map(|(src, dst)| run_one(src, dst, &per_file, &pb))
            .collect::<Result<Vec<_>>>()?,
    };
    pb.finish_and_clear();

    let mut total = ConvertStats::default();
    for part in &parts {
        total.merge(part);
    }
    Ok(total)
}
