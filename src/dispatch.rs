// src/dispatch.rs
// ============================================================================
// DISPATCH - Clasifica la ruta de entrada y la enruta
// ============================================================================
//
//   archivo .safetensors  -> builder   (salida = archivo, o dir/<nombre>)
//   manifest              -> index     (salida = directorio)
//   directorio            -> todos los .safetensors, luego los manifests
//   otra cosa             -> InvalidInput
//
// En un directorio cada shard se convierte UNA vez: al reescribir los
// manifests solo se convierten los shards que el recorrido no produjo.
//
// ============================================================================

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::batch::{convert_batch, Job};
use crate::builder::{convert_file, ConvertStats};
use crate::config::ConvertOptions;
use crate::error::{ConvertError, IoContext, Result};
use crate::index::{self, has_index_name, probe_index};
use crate::safetensor::is_safetensors_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Archive,
    Manifest,
    Directory,
}

pub fn classify(input: &Path) -> Result<InputKind> {
    if input.is_dir() {
        return Ok(InputKind::Directory);
    }
    if !input.is_file() {
        return Err(ConvertError::InvalidInput(format!(
            "{} is not a file or directory",
            input.display()
        )));
    }
    if is_safetensors_path(input) {
        return Ok(InputKind::Archive);
    }
    // Por nombre: los errores de parseo se reportan al convertir
    if has_index_name(input) || probe_index(input) {
        return Ok(InputKind::Manifest);
    }
    Err(ConvertError::InvalidInput(format!(
        "unrecognized file {}: provide a .safetensors file or an index.json",
        input.display()
    )))
}

/// Punto de entrada: convierte `input` (archivo, manifest o directorio)
pub fn convert_path(input: &Path, output: &Path, opts: &ConvertOptions) -> Result<ConvertStats> {
    match classify(input)? {
        InputKind::Archive => {
            let dst = if output.is_dir() {
                output.join(input.file_name().unwrap_or_default())
            } else {
                output.to_path_buf()
            };
            convert_file(input, &dst, opts)
        }
        InputKind::Manifest => index::convert_index(input, output, opts),
        InputKind::Directory => convert_dir(input, output, opts),
    }
}

/// Contenido directo de `dir` (no recursivo), ordenado por nombre
fn list_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).at(dir)? {
        paths.push(entry.at(dir)?.path());
    }
    paths.sort();
    Ok(paths)
}

fn convert_dir(dir: &Path, out_dir: &Path, opts: &ConvertOptions) -> Result<ConvertStats> {
    if out_dir.is_file() {
        return Err(ConvertError::InvalidInput(format!(
            "input {} is a directory but output {} is a file",
            dir.display(),
            out_dir.display()
        )));
    }

    let mut archives: Vec<Job> = Vec::new();
    let mut manifests = Vec::new();
    for path in list_dir(dir)? {
        if !path.is_file() {
            log::debug!("skipping {} (not a file)", path.display());
        } else if is_safetensors_path(&path) {
            let dst = out_dir.join(path.file_name().unwrap_or_default());
            archives.push((path, dst));
        } else if has_index_name(&path) || probe_index(&path) {
            manifests.push(path);
        } else {
            log::debug!("skipping {}", path.display());
        }
    }

    if archives.is_empty() && manifests.is_empty() {
        log::warn!("{}: no .safetensors files or manifests found", dir.display());
    }

    std::fs::create_dir_all(out_dir).at(out_dir)?;
    let mut stats = convert_batch(&archives, opts)?;

    let mut done = HashSet::with_capacity(archives.len());
    for (src, _) in &archives {
        done.insert(src.canonicalize().at(src)?);
    }
    for manifest in &manifests {
        let part = index::convert_index_with(manifest, out_dir, opts, &done)?;
        stats.merge(&part);
    }
    Ok(stats)
}
