// src/index/manifest.rs
// ============================================================================
// MANIFEST - model.safetensors.index.json
// ============================================================================
//
// {
//   "metadata":   { ... libre, a veces "total_size": <u64> },
//   "weight_map": { "<tensor>": "<shard relativo>", ... },
//   "format":     "pt"            (opcional)
// }
//
// weight_map conserva el orden del archivo (serde_json con preserve_order).
//
// ============================================================================

use std::path::Path;

use serde_json::{Map, Value};

use crate::error::{ConvertError, IoContext, Result};

pub const INDEX_SUFFIX: &str = ".safetensors.index.json";
pub const TOTAL_SIZE_KEY: &str = "total_size";

#[derive(Debug, Clone, PartialEq)]
pub struct ShardIndex {
    pub metadata: Map<String, Value>,
    /// (tensor, shard) en orden de declaración
    pub weight_map: Vec<(String, String)>,
    pub format: Option<String>,
}

impl ShardIndex {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).at(path)?;
        Self::parse(path, &text)
    }

    /// `path` solo se usa en los mensajes de error
    pub fn parse(path: &Path, text: &str) -> Result<Self> {
        let root: Value = serde_json::from_str(text)
            .map_err(|e| ConvertError::malformed(path, format!("invalid JSON: {}", e)))?;
        let Value::Object(mut root) = root else {
            return Err(ConvertError::malformed(path, "manifest is not a JSON object"));
        };

        let metadata = match root.remove("metadata") {
            Some(Value::Object(m)) => m,
            Some(Value::Null) => Map::new(),
            Some(_) => return Err(ConvertError::malformed(path, "'metadata' is not an object")),
            None => return Err(ConvertError::malformed(path, "missing 'metadata'")),
        };

        let weight_map = match root.remove("weight_map") {
            Some(Value::Object(m)) => m
                .into_iter()
                .map(|(name, shard)| match shard {
                    Value::String(s) if !s.is_empty() => Ok((name, s)),
                    other => Err(ConvertError::malformed(
                        path,
                        format!("weight_map['{}'] is not a file name: {}", name, other),
                    )),
                })
                .collect::<Result<Vec<_>>>()?,
            Some(_) => return Err(ConvertError::malformed(path, "'weight_map' is not an object")),
            None => return Err(ConvertError::malformed(path, "missing 'weight_map'")),
        };

        let format = match root.remove("format") {
            Some(Value::String(s)) => Some(s),
            Some(other) => {
                log::warn!("{}: ignoring non-string 'format' ({})", path.display(), other);
                None
            }
            None => None,
        };

        Ok(Self {
            metadata,
            weight_map,
            format,
        })
    }

    /// Shards referenciados, sin repetir, en orden de primera aparición
    pub fn shard_files(&self) -> Vec<&str> {
        let mut seen = std::collections::HashSet::new();
        self.weight_map
            .iter()
            .map(|(_, shard)| shard.as_str())
            .filter(|s| seen.insert(*s))
            .collect()
    }

    /// JSON con indentación de 2 espacios: metadata, weight_map, format
    pub fn to_json_pretty(&self) -> Result<String> {
        let mut root = Map::new();
        root.insert("metadata".to_string(), Value::Object(self.metadata.clone()));
        let weight_map: Map<String, Value> = self
            .weight_map
            .iter()
            .map(|(name, shard)| (name.clone(), Value::String(shard.clone())))
            .collect();
        root.insert("weight_map".to_string(), Value::Object(weight_map));
        if let Some(format) = &self.format {
            root.insert("format".to_string(), Value::String(format.clone()));
        }
        serde_json::to_string_pretty(&Value::Object(root))
            .map_err(|e| ConvertError::malformed("<manifest>", e.to_string()))
    }
}

/// Heurística por nombre: *.safetensors.index.json
pub fn has_index_name(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map_or(false, |n| n.ends_with(INDEX_SUFFIX))
}

/// Sondeo por contenido: un .json que parsea como manifest
pub fn probe_index(path: &Path) -> bool {
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| e.eq_ignore_ascii_case("json"));
    is_json && path.is_file() && ShardIndex::load(path).is_ok()
}
