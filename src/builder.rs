// src/builder.rs
// ============================================================================
// BUILDER - Convierte UN archivo safetensors a la precisión destino
// ============================================================================
//
// El builder es TONTO:
// - NO decide rutas (lo hace el dispatcher / el coordinador del index)
// - NO interpreta tensores no flotantes (se copian byte a byte)
// - Solo lee, transcodifica, escribe
//
// Orden de salida = orden de declaración de entrada. Metadata de usuario
// + dos breadcrumbs que registran la conversión.
//
// ============================================================================

use std::io::Write;
use std::path::Path;

use crate::atomic::AtomicFile;
use crate::config::ConvertOptions;
use crate::error::{ConvertError, IoContext, Result};
use crate::safetensor::{Metadata, SafetensorFile, SafetensorWriter, TargetDtype, TensorEntry};
use crate::transcode;
use crate::verify;

/// Breadcrumb: quién convirtió
pub const CONVERTED_BY_KEY: &str = "converted_by";
pub const CONVERTED_BY_VALUE: &str = "bf16<->fp16 converter";

/// Breadcrumb: a qué precisión
pub const TARGET_DTYPE_KEY: &str = "converted_target_dtype";

/// Estadísticas de conversión
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConvertStats {
    pub files: usize,
    /// Tensores flotantes transcodificados
    pub converted_count: usize,
    /// Tensores copiados tal cual (no flotantes o ya en destino)
    pub passthrough_count: usize,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl ConvertStats {
    pub fn total_tensors(&self) -> usize {
        self.converted_count + self.passthrough_count
    }

    pub fn merge(&mut self, part: &ConvertStats) {
        self.files += part.files;
        self.converted_count += part.converted_count;
        self.passthrough_count += part.passthrough_count;
        self.bytes_in += part.bytes_in;
        self.bytes_out += part.bytes_out;
    }
}

/// Añade (o sobrescribe) los breadcrumbs
pub fn add_breadcrumbs(metadata: &mut Metadata, target: TargetDtype) {
    metadata.insert(CONVERTED_BY_KEY.to_string(), CONVERTED_BY_VALUE.to_string());
    metadata.insert(TARGET_DTYPE_KEY.to_string(), target.as_str().to_string());
}

/// Layout de salida: los flotantes pasan a `target`, el resto igual.
/// Falla antes de escribir nada si hay un flotante no soportado.
pub fn plan_entries(entries: &[TensorEntry], target: TargetDtype) -> Result<Vec<TensorEntry>> {
    let target = target.dtype();
    entries
        .iter()
        .map(|e| {
            let mut out = e.clone();
            if e.dtype.is_float() && e.dtype != target {
                if !transcode::is_supported(e.dtype) {
                    return Err(ConvertError::UnsupportedDtype(format!(
                        "tensor '{}' has dtype {} (supported floats: BF16, F16, F32, F64)",
                        e.name, e.dtype
                    )));
                }
                out.dtype = target;
            }
            Ok(out)
        })
        .collect()
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Convierte `input` en `output` (escritura atómica)
pub fn convert_file(input: &Path, output: &Path, opts: &ConvertOptions) -> Result<ConvertStats> {
    if same_file(input, output) {
        return Err(ConvertError::InvalidInput(format!(
            "output {} would overwrite the input",
            output.display()
        )));
    }

    let file = SafetensorFile::open(input)?;
    let planned = plan_entries(file.tensor_entries(), opts.target)?;

    let mut metadata = file.metadata().clone();
    add_breadcrumbs(&mut metadata, opts.target);

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).at(parent)?;
        }
    }

    let mut stats = ConvertStats {
        files: 1,
        bytes_in: file.data_len() as u64,
        ..Default::default()
    };

    let mut writer = SafetensorWriter::create(output, &planned, &metadata)?;

    for (src, dst) in file.tensor_entries().iter().zip(&planned) {
        let payload = file.read_payload(src)?;

        if src.dtype == dst.dtype {
            writer.write_tensor(payload)?;
            stats.passthrough_count += 1;
            continue;
        }

        log::debug!("  {} {} -> {} {:?}", src.name, src.dtype, dst.dtype, src.shape);
        writer.write_tensor_with(|sink| {
            transcode::transcode_stream(src.dtype, dst.dtype, payload, opts.chunk_elems, |chunk| {
                sink.write_all(chunk).at(output)
            })
        })?;
        stats.converted_count += 1;
    }

    let (staged, bytes_out) = writer.stage()?;
    commit_checked(staged, |written| {
        if opts.verify {
            verify::verify_written(&file, written, output, opts.target)
        } else {
            Ok(())
        }
    })?;
    stats.bytes_out = bytes_out;

    log::info!(
        "{} -> {}: {} converted, {} passthrough",
        input.display(),
        output.display(),
        stats.converted_count,
        stats.passthrough_count
    );
    if opts.progress {
        println!(
            "[OK] {}  ->  {}",
            file_name(input),
            file_name(output)
        );
    }

    Ok(stats)
}

/// Publica `staged` solo si `check` acepta el temporal. Si falla, el destino
/// queda como estaba y el temporal se borra al soltar el `AtomicFile`.
fn commit_checked<F>(staged: AtomicFile, check: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    check(staged.temp_path())?;
    staged.commit()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
