// src/testing.rs
// ============================================================================
// TESTING - Fixtures para tests (archivos safetensors construidos a mano)
// ============================================================================
//
// Independiente del writer: así los tests del writer comparan contra un
// archivo construido por otra vía.
//
// ============================================================================

use std::path::Path;

use half::{bf16, f16};
use serde_json::{json, Map, Value};

use crate::safetensor::{Dtype, METADATA_KEY};

pub type Tensor<'a> = (&'a str, Dtype, Vec<usize>, Vec<u8>);

/// Construye los bytes de un .safetensors
pub fn build_archive(tensors: &[Tensor<'_>], metadata: &[(&str, &str)]) -> Vec<u8> {
    let mut header = Map::new();
    if !metadata.is_empty() {
        let meta: Map<String, Value> = metadata
            .iter()
            .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
            .collect();
        header.insert(METADATA_KEY.to_string(), Value::Object(meta));
    }

    let mut data = Vec::new();
    for (name, dtype, shape, bytes) in tensors {
        let begin = data.len();
        data.extend_from_slice(bytes);
        header.insert(
            name.to_string(),
            json!({
                "dtype": dtype.as_str(),
                "shape": shape,
                "data_offsets": [begin, data.len()],
            }),
        );
    }

    let mut header = serde_json::to_vec(&Value::Object(header)).unwrap();
    while header.len() % 8 != 0 {
        header.push(b' ');
    }

    let mut out = (header.len() as u64).to_le_bytes().to_vec();
    out.extend_from_slice(&header);
    out.extend_from_slice(&data);
    out
}

pub fn write_archive(path: &Path, tensors: &[Tensor<'_>], metadata: &[(&str, &str)]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(path, build_archive(tensors, metadata)).unwrap();
}

/// Header arbitrario (posiblemente inválido) + datos
pub fn write_raw(path: &Path, header: &str, data: &[u8]) {
    let mut out = (header.len() as u64).to_le_bytes().to_vec();
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(data);
    std::fs::write(path, out).unwrap();
}

pub fn bf16_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|&v| bf16::from_f32(v).to_le_bytes()).collect()
}

pub fn f16_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|&v| f16::from_f32(v).to_le_bytes()).collect()
}

pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn i32_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn f16_values(bytes: &[u8]) -> Vec<f16> {
    bytes.chunks_exact(2).map(|b| f16::from_le_bytes([b[0], b[1]])).collect()
}

pub fn bf16_values(bytes: &[u8]) -> Vec<bf16> {
    bytes.chunks_exact(2).map(|b| bf16::from_le_bytes([b[0], b[1]])).collect()
}
