// src/verify.rs
// ============================================================================
// VERIFY - Comprueba una salida contra su entrada (--verify)
// ============================================================================
//
// Reabre el archivo convertido y exige:
//   - mismos nombres, en el mismo orden, con el mismo shape
//   - no flotantes: mismo dtype y mismo XXH3-64 del payload
//   - flotantes: dtype == destino
//   - breadcrumbs presentes con el destino correcto
//
// ============================================================================

use std::path::Path;

use xxhash_rust::xxh3::xxh3_64;

use crate::builder::{CONVERTED_BY_KEY, TARGET_DTYPE_KEY};
use crate::error::{ConvertError, Result};
use crate::safetensor::{SafetensorFile, TargetDtype};

pub fn verify_conversion(input: &SafetensorFile, output: &Path, target: TargetDtype) -> Result<()> {
    verify_written(input, output, output, target)
}

/// Verifica el archivo en `written` (p. ej. el temporal aún sin publicar);
/// los errores se reportan contra `output`.
pub fn verify_written(
    input: &SafetensorFile,
    written: &Path,
    output: &Path,
    target: TargetDtype,
) -> Result<()> {
    let out = SafetensorFile::open(written)?;
    let fail = |reason: String| Err(ConvertError::malformed(output, format!("verify: {}", reason)));

    let src_entries = input.tensor_entries();
    let dst_entries = out.tensor_entries();
    if src_entries.len() != dst_entries.len() {
        return fail(format!(
            "{} tensors in input, {} in output",
            src_entries.len(),
            dst_entries.len()
        ));
    }

    for (s, d) in src_entries.iter().zip(dst_entries) {
        if s.name != d.name {
            return fail(format!("expected tensor '{}', found '{}'", s.name, d.name));
        }
        if s.shape != d.shape {
            return fail(format!("tensor '{}': shape {:?} became {:?}", s.name, s.shape, d.shape));
        }

        if s.dtype.is_float() {
            if d.dtype != target.dtype() {
                return fail(format!("tensor '{}': dtype {} is not {}", s.name, d.dtype, target.dtype()));
            }
            continue;
        }

        if s.dtype != d.dtype {
            return fail(format!("tensor '{}': dtype {} became {}", s.name, s.dtype, d.dtype));
        }
        let before = xxh3_64(input.read_payload(s)?);
        let after = xxh3_64(out.read_payload(d)?);
        if before != after {
            return fail(format!(
                "tensor '{}': payload changed (xxh3 {:016x} != {:016x})",
                s.name, before, after
            ));
        }
    }

    let meta = out.metadata();
    if !meta.contains_key(CONVERTED_BY_KEY) {
        return fail(format!("missing metadata key '{}'", CONVERTED_BY_KEY));
    }
    if meta.get(TARGET_DTYPE_KEY).map(String::as_str) != Some(target.as_str()) {
        return fail(format!("metadata '{}' is not '{}'", TARGET_DTYPE_KEY, target));
    }

    log::debug!("verified {} ({} tensors)", output.display(), dst_entries.len());
    Ok(())
}
