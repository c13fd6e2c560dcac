// src/index/mod.rs
// ============================================================================
// INDEX - Convierte un modelo sharded a partir de su manifest
// ============================================================================
//
// 1. Lee el manifest y resuelve cada shard relativo a su directorio
// 2. Convierte cada shard (una vez, aunque aparezca muchas veces)
// 3. Reescribe el manifest en el directorio de salida:
//    - weight_map apunta a los nombres base de los shards convertidos
//    - metadata + breadcrumbs, total_size recalculado si existía
// 4. El manifest se escribe el ÚLTIMO: si existe, sus shards también
//
// ============================================================================

pub mod manifest;

pub use manifest::{has_index_name, probe_index, ShardIndex, INDEX_SUFFIX, TOTAL_SIZE_KEY};

use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::atomic;
use crate::batch::{convert_batch, Job};
use crate::builder::{ConvertStats, CONVERTED_BY_KEY, CONVERTED_BY_VALUE, TARGET_DTYPE_KEY};
use crate::config::ConvertOptions;
use crate::error::{ConvertError, IoContext, Result};
use crate::safetensor::{is_safetensors_path, SafetensorFile, TargetDtype};

/// Una salida con sufijo .safetensors se interpreta como "su directorio"
pub fn output_dir(output: &Path) -> PathBuf {
    if is_safetensors_path(output) {
        match output.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    } else {
        output.to_path_buf()
    }
}

/// Convierte el manifest `index_path` y todos sus shards hacia `output`
pub fn convert_index(index_path: &Path, output: &Path, opts: &ConvertOptions) -> Result<ConvertStats> {
    convert_index_with(index_path, output, opts, &HashSet::new())
}

/// Como `convert_index`, pero no reconvierte los shards cuya ruta canónica
/// esté en `already_converted` (ya escritos en el mismo directorio de salida)
pub fn convert_index_with(
    index_path: &Path,
    output: &Path,
    opts: &ConvertOptions,
    already_converted: &HashSet<PathBuf>,
) -> Result<ConvertStats> {
    let index = ShardIndex::load(index_path)?;
    let out_dir = output_dir(output);
    let base = index_path.parent().unwrap_or_else(|| Path::new(""));

    // shard relativo -> nombre base en la salida
    let mut renamed: HashMap<String, String> = HashMap::new();
    let mut owners: HashMap<String, String> = HashMap::new();
    let mut jobs: Vec<Job> = Vec::new();

    for rel in index.shard_files() {
        let src = base.join(rel);
        if !src.is_file() {
            return Err(ConvertError::MissingShard {
                index: index_path.to_path_buf(),
                shard: src,
            });
        }
        let name = src
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| ConvertError::malformed(index_path, format!("shard '{}' has no file name", rel)))?;

        if let Some(prev) = owners.insert(name.clone(), rel.to_string()) {
            return Err(ConvertError::InvalidInput(format!(
                "shards '{}' and '{}' would both be written as {}",
                prev, rel, name
            )));
        }
        renamed.insert(rel.to_string(), name.clone());

        let canonical = src.canonicalize().at(&src)?;
        if already_converted.contains(&canonical) {
            log::debug!("{} already converted, skipping", src.display());
            continue;
        }
        jobs.push((src, out_dir.join(&name)));
    }

    std::fs::create_dir_all(&out_dir).at(&out_dir)?;
    log::info!(
        "{}: {} shards ({} to convert) -> {}",
        index_path.display(),
        renamed.len(),
        jobs.len(),
        out_dir.display()
    );
    let stats = convert_batch(&jobs, opts)?;

    let total_size = check_shards(index_path, &index, &renamed, &out_dir)?;
    let rewritten = rewrite_index(index, &renamed, total_size, opts.target);

    let dest = out_dir.join(
        index_path
            .file_name()
            .unwrap_or_else(|| OsStr::new("model.safetensors.index.json")),
    );
    atomic::write_atomic(&dest, rewritten.to_json_pretty()?.as_bytes())?;

    if opts.progress {
        println!("[OK] {}  ->  {}", index_path.display(), dest.display());
    }
    Ok(stats)
}

/// Cada nombre del weight_map existe en su shard de salida y cada tensor
/// flotante de los shards aparece en el weight_map. Los no flotantes sin
/// listar (buffers, contadores) solo avisan.
/// Devuelve la suma de las secciones de datos de los shards.
fn check_shards(
    index_path: &Path,
    index: &ShardIndex,
    renamed: &HashMap<String, String>,
    out_dir: &Path,
) -> Result<u64> {
    let mut total = 0u64;
    for rel in index.shard_files() {
        let path = out_dir.join(&renamed[rel]);
        let shard = SafetensorFile::open(&path)?;
        total += shard.data_len() as u64;

        let mut listed = HashSet::new();
        for (name, _) in index.weight_map.iter().filter(|(_, s)| s == rel) {
            if shard.entry(name).is_none() {
                return Err(ConvertError::malformed(
                    index_path,
                    format!("tensor '{}' not found in shard {}", name, path.display()),
                ));
            }
            listed.insert(name.as_str());
        }

        let mut orphans = 0usize;
        for entry in shard.tensor_entries() {
            if listed.contains(entry.name.as_str()) {
                continue;
            }
            if entry.dtype.is_float() {
                return Err(ConvertError::malformed(
                    index_path,
                    format!(
                        "floating-point tensor '{}' in shard {} is not listed in the weight_map",
                        entry.name, rel
                    ),
                ));
            }
            orphans += 1;
        }
        if orphans > 0 {
            log::warn!("{}: {} tensors not listed in the weight_map", path.display(), orphans);
        }
    }
    Ok(total)
}

fn rewrite_index(
    mut index: ShardIndex,
    renamed: &HashMap<String, String>,
    total_size: u64,
    target: TargetDtype,
) -> ShardIndex {
    for (_, shard) in index.weight_map.iter_mut() {
        if let Some(name) = renamed.get(shard.as_str()) {
            *shard = name.clone();
        }
    }

    let meta = &mut index.metadata;
    meta.insert(CONVERTED_BY_KEY.to_string(), Value::from(CONVERTED_BY_VALUE));
    meta.insert(TARGET_DTYPE_KEY.to_string(), Value::from(target.as_str()));
    if meta.contains_key(TOTAL_SIZE_KEY) {
        meta.insert(TOTAL_SIZE_KEY.to_string(), Value::from(total_size));
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safetensor::Dtype;
    use crate::testing::{bf16_bytes, f32_bytes, i32_bytes, write_archive};
    use serde_json::json;

    /// Dos shards con un tensor cada uno + manifest
    fn sharded_model(dir: &Path) -> PathBuf {
        write_archive(
            &dir.join("model-00001-of-00002.safetensors"),
            &[("a", Dtype::F32, vec![2], f32_bytes(&[1.0, 2.0]))],
            &[],
        );
        write_archive(
            &dir.join("model-00002-of-00002.safetensors"),
            &[("b", Dtype::BF16, vec![2], bf16_bytes(&[3.0, 4.0]))],
            &[],
        );
        let index = dir.join("model.safetensors.index.json");
        std::fs::write(
            &index,
            json!({
                "metadata": {"total_size": 16},
                "weight_map": {
                    "a": "model-00001-of-00002.safetensors",
                    "b": "model-00002-of-00002.safetensors"
                }
            })
            .to_string(),
        )
        .unwrap();
        index
    }

    #[test]
    fn test_sharded_model_to_fp16() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let index = sharded_model(src.path());

        let stats = convert_index(&index, dst.path(), &ConvertOptions::new(TargetDtype::Fp16)).unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(stats.converted_count, 2);

        for (shard, name) in [
            ("model-00001-of-00002.safetensors", "a"),
            ("model-00002-of-00002.safetensors", "b"),
        ] {
            let out = SafetensorFile::open(dst.path().join(shard)).unwrap();
            assert_eq!(out.entry(name).unwrap().dtype, Dtype::F16);
        }

        let rewritten = ShardIndex::load(&dst.path().join("model.safetensors.index.json")).unwrap();
        assert_eq!(
            rewritten.weight_map,
            vec![
                ("a".to_string(), "model-00001-of-00002.safetensors".to_string()),
                ("b".to_string(), "model-00002-of-00002.safetensors".to_string()),
            ]
        );
        assert_eq!(rewritten.metadata.get(TARGET_DTYPE_KEY), Some(&json!("fp16")));
        assert_eq!(rewritten.metadata.get(CONVERTED_BY_KEY), Some(&json!(CONVERTED_BY_VALUE)));
        // F32 [2] -> F16 [2] = 4 bytes, BF16 [2] -> F16 [2] = 4 bytes
        assert_eq!(rewritten.metadata.get(TOTAL_SIZE_KEY), Some(&json!(8)));
        assert_eq!(rewritten.format, None);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let src = tempfile::tempdir().unwrap();
        let seq = tempfile::tempdir().unwrap();
        let par = tempfile::tempdir().unwrap();
        let index = sharded_model(src.path());

        convert_index(&index, seq.path(), &ConvertOptions::default()).unwrap();
        convert_index(&index, par.path(), &ConvertOptions::default().with_jobs(4)).unwrap();

        for name in [
            "model-00001-of-00002.safetensors",
            "model-00002-of-00002.safetensors",
            "model.safetensors.index.json",
        ] {
            assert_eq!(
                std::fs::read(seq.path().join(name)).unwrap(),
                std::fs::read(par.path().join(name)).unwrap(),
                "{}",
                name
            );
        }
    }

    #[test]
    fn test_missing_shard() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let index = sharded_model(src.path());
        std::fs::remove_file(src.path().join("model-00002-of-00002.safetensors")).unwrap();

        let err = convert_index(&index, dst.path(), &ConvertOptions::default()).unwrap_err();
        assert_eq!(err.kind(), "MissingShard");
        assert!(!dst.path().join("model.safetensors.index.json").exists());
    }

    #[test]
    fn test_tensor_missing_from_shard() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write_archive(
            &src.path().join("s.safetensors"),
            &[("a", Dtype::I32, vec![1], i32_bytes(&[1]))],
            &[],
        );
        let index = src.path().join("m.safetensors.index.json");
        std::fs::write(
            &index,
            r#"{"metadata": {}, "weight_map": {"a": "s.safetensors", "ghost": "s.safetensors"}}"#,
        )
        .unwrap();

        let err = convert_index(&index, dst.path(), &ConvertOptions::default()).unwrap_err();
        assert_eq!(err.kind(), "MalformedArchive");
        assert!(err.to_string().contains("ghost"));
        assert!(!dst.path().join("m.safetensors.index.json").exists());
    }

    #[test]
    fn test_unlisted_tensors_in_shard() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write_archive(
            &src.path().join("s.safetensors"),
            &[
                ("a", Dtype::F32, vec![1], f32_bytes(&[1.0])),
                ("step", Dtype::I32, vec![1], i32_bytes(&[7])),
                ("lm_head", Dtype::BF16, vec![1], bf16_bytes(&[0.5])),
            ],
            &[],
        );

        // un entero sin listar solo avisa
        let ints = src.path().join("ints.json");
        std::fs::write(
            &ints,
            r#"{"metadata": {}, "weight_map": {"a": "s.safetensors", "lm_head": "s.safetensors"}}"#,
        )
        .unwrap();
        convert_index(&ints, dst.path(), &ConvertOptions::default()).unwrap();
        assert!(dst.path().join("ints.json").is_file());

        // un flotante sin listar es un manifest inconsistente
        let floats = src.path().join("floats.json");
        std::fs::write(
            &floats,
            r#"{"metadata": {}, "weight_map": {"a": "s.safetensors", "step": "s.safetensors"}}"#,
        )
        .unwrap();
        let err = convert_index(&floats, dst.path(), &ConvertOptions::default()).unwrap_err();
        assert_eq!(err.kind(), "MalformedArchive");
        assert!(err.to_string().contains("lm_head"));
        assert!(!dst.path().join("floats.json").exists());
    }

    #[test]
    fn test_nested_shards_and_collisions() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write_archive(
            &src.path().join("part1/w.safetensors"),
            &[("a", Dtype::F32, vec![1], f32_bytes(&[1.0]))],
            &[],
        );
        write_archive(
            &src.path().join("part2/w.safetensors"),
            &[("b", Dtype::F32, vec![1], f32_bytes(&[2.0]))],
            &[],
        );

        // subdirectorio: la salida usa el nombre base
        let ok = src.path().join("ok.json");
        std::fs::write(
            &ok,
            r#"{"metadata": {"note": "kept"}, "weight_map": {"a": "part1/w.safetensors"}, "format": "pt"}"#,
        )
        .unwrap();
        convert_index(&ok, &dst.path().join("model.safetensors"), &ConvertOptions::default()).unwrap();
        let rewritten = ShardIndex::load(&dst.path().join("ok.json")).unwrap();
        assert_eq!(rewritten.weight_map, vec![("a".to_string(), "w.safetensors".to_string())]);
        assert_eq!(rewritten.format.as_deref(), Some("pt"));
        assert_eq!(rewritten.metadata.get("note"), Some(&json!("kept")));
        assert!(!rewritten.metadata.contains_key(TOTAL_SIZE_KEY));
        assert!(dst.path().join("w.safetensors").is_file());

        // dos shards con el mismo nombre base
        let clash = src.path().join("clash.json");
        std::fs::write(
            &clash,
            r#"{"metadata": {}, "weight_map": {"a": "part1/w.safetensors", "b": "part2/w.safetensors"}}"#,
        )
        .unwrap();
        let err = convert_index(&clash, dst.path(), &ConvertOptions::default()).unwrap_err();
        assert_eq!(err.kind(), "InvalidInput");
    }

    #[test]
    fn test_skips_already_converted() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let index = sharded_model(src.path());
        let opts = ConvertOptions::default();

        let first = src.path().join("model-00001-of-00002.safetensors");
        crate::builder::convert_file(&first, &dst.path().join("model-00001-of-00002.safetensors"), &opts)
            .unwrap();

        let done: HashSet<PathBuf> = [first.canonicalize().unwrap()].into_iter().collect();
        let stats = convert_index_with(&index, dst.path(), &opts, &done).unwrap();
        assert_eq!(stats.files, 1);
        assert!(dst.path().join("model.safetensors.index.json").is_file());
    }

    #[test]
    fn test_output_dir() {
        assert_eq!(output_dir(Path::new("out/model.safetensors")), PathBuf::from("out"));
        assert_eq!(output_dir(Path::new("model.safetensors")), PathBuf::from("."));
        assert_eq!(output_dir(Path::new("out/bf16")), PathBuf::from("out/bf16"));
    }
}
