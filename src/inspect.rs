// src/inspect.rs
// ============================================================================
// INSPECT - Diagnóstico: histograma de dtypes y listado de tensores
// ============================================================================

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::Result;
use crate::safetensor::{Dtype, SafetensorFile};

/// dtype -> número de tensores
pub type DtypeHistogram = BTreeMap<String, usize>;

pub fn histogram(file: &SafetensorFile) -> DtypeHistogram {
    let mut counts = DtypeHistogram::new();
    for entry in file.tensor_entries() {
        *counts.entry(entry.dtype.to_string()).or_insert(0) += 1;
    }
    counts
}

/// Histograma de dtypes de un único .safetensors
pub fn dtype_histogram(path: &Path) -> Result<DtypeHistogram> {
    Ok(histogram(&SafetensorFile::open(path)?))
}

/// `{"BF16": 2, "I32": 1}`
pub fn format_histogram(counts: &DtypeHistogram) -> String {
    serde_json::to_string(counts).unwrap_or_else(|_| format!("{:?}", counts))
}

#[derive(Debug, Clone, PartialEq)]
pub struct TensorSummary {
    pub name: String,
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub bytes: u64,
}

/// Tensores en orden de declaración
pub fn summarize(file: &SafetensorFile) -> Vec<TensorSummary> {
    file.tensor_entries()
        .iter()
        .map(|e| TensorSummary {
            name: e.name.clone(),
            dtype: e.dtype,
            shape: e.shape.clone(),
            bytes: e.byte_len() as u64,
        })
        .collect()
}

pub fn format_size(size: u64) -> String {
    if size == 0 {
        "empty".to_string()
    } else if size < 1024 {
        format!("{} B", size)
    } else if size < 1024 * 1024 {
        format!("{:.1} KB", size as f64 / 1024.0)
    } else if size < 1024 * 1024 * 1024 {
        format!("{:.1} MB", size as f64 / 1024.0 / 1024.0)
    } else {
        format!("{:.2} GB", size as f64 / 1024.0 / 1024.0 / 1024.0)
    }
}
