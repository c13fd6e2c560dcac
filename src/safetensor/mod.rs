// src/safetensor/mod.rs
// ============================================================================
// SAFETENSOR - Lectura de archivos .safetensors
// ============================================================================
//
// Formato:
//   [0:8]       header_len      u64 little-endian
//   [8:8+H]     header          JSON {nombre: {dtype, shape, data_offsets}}
//                               + clave reservada "__metadata__" (opcional)
//   [8+H:]      data region     payloads contiguos, row-major, LE
//
// El reader no interpreta valores: sólo valida que el índice del header
// cuadra con la región de datos y expone vistas de bytes (mmap, zero-copy).
//
// ============================================================================

pub mod dtype;
pub mod writer;

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};
use memmap2::Mmap;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{ConvertError, IoContext, Result};

pub use dtype::{Dtype, TargetDtype};
pub use writer::{write_safetensors, SafetensorWriter};

/// Clave reservada del header para metadata de usuario
pub const METADATA_KEY: &str = "__metadata__";

/// Extensión de los archivos de tensores
pub const SAFETENSORS_EXT: &str = "safetensors";

/// Límite del header JSON (100 MB)
pub const MAX_HEADER_SIZE: usize = 100_000_000;

/// Metadata de usuario (string -> string)
pub type Metadata = BTreeMap<String, String>;

/// Entrada del header tal y como se deserializa
#[derive(Debug, Clone, Deserialize)]
struct RawTensorInfo {
    dtype: Dtype,
    shape: Vec<usize>,
    data_offsets: [usize; 2],
}

/// Un tensor del índice, en orden de declaración
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorEntry {
    pub name: String,
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    /// [begin, end) relativo al inicio de la región de datos
    pub data_offsets: [usize; 2],
}

impl TensorEntry {
    pub fn new(name: impl Into<String>, dtype: Dtype, shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
            data_offsets: [0, 0],
        }
    }

    /// Número de elementos (`[]` es un escalar)
    pub fn numel(&self) -> Option<usize> {
        self.shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Bytes que debe ocupar el payload según dtype y shape
    pub fn expected_len(&self) -> Option<usize> {
        self.numel()?.checked_mul(self.dtype.size())
    }

    pub fn byte_len(&self) -> usize {
        self.data_offsets[1] - self.data_offsets[0]
    }
}

/// Archivo safetensor abierto (mmap)
#[derive(Debug)]
pub struct SafetensorFile {
    path: PathBuf,
    entries: Vec<TensorEntry>,
    metadata: Metadata,
    data_start: usize,
    mmap: Mmap,
}

impl SafetensorFile {
    /// Abre y valida un archivo safetensor
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).at(&path)?;

        let file_len = file.metadata().at(&path)?.len() as usize;
        if file_len < 8 {
            return Err(ConvertError::malformed(
                &path,
                format!("file too small: {} bytes", file_len),
            ));
        }

        // SAFETY: el mapping es de sólo lectura y `file` sigue abierto
        // mientras se crea. Si otro proceso modifica el archivo podemos ver
        // datos inconsistentes, pero los offsets ya están validados contra
        // la longitud del mapping y todo acceso pasa por `get`.
        let mmap = unsafe { Mmap::map(&file) }.at(&path)?;

        let header_len = Cursor::new(&mmap[..8])
            .read_u64::<LittleEndian>()
            .at(&path)? as usize;

        if header_len > MAX_HEADER_SIZE {
            return Err(ConvertError::malformed(
                &path,
                format!("header too large: {} bytes", header_len),
            ));
        }
        let data_start = 8 + header_len;
        if data_start > mmap.len() {
            return Err(ConvertError::malformed(
                &path,
                format!(
                    "header length {} exceeds file size {}",
                    header_len,
                    mmap.len()
                ),
            ));
        }

        let (entries, metadata) = parse_header(&path, &mmap[8..data_start])?;
        validate_layout(&entries, mmap.len() - data_start)
            .map_err(|reason| ConvertError::malformed(&path, reason))?;

        log::debug!(
            "opened {} ({} tensors, header {} bytes)",
            path.display(),
            entries.len(),
            header_len
        );

        Ok(Self {
            path,
            entries,
            metadata,
            data_start,
            mmap,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Metadata de usuario (vacía si no hay `__metadata__`)
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Índice del header en orden de declaración
    pub fn tensor_entries(&self) -> &[TensorEntry] {
        &self.entries
    }

    pub fn entry(&self, name: &str) -> Option<&TensorEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Vista zero-copy del payload de un tensor
    pub fn read_payload(&self, entry: &TensorEntry) -> Result<&[u8]> {
        let [begin, end] = entry.data_offsets;
        self.mmap
            .get(self.data_start + begin..self.data_start + end)
            .ok_or_else(|| {
                ConvertError::malformed(
                    &self.path,
                    format!("tensor '{}' range [{}, {}) out of bounds", entry.name, begin, end),
                )
            })
    }

    /// Tamaño de la región de datos
    pub fn data_len(&self) -> usize {
        self.mmap.len() - self.data_start
    }

    /// Tamaño del header JSON (sin los 8 bytes de longitud)
    pub fn header_len(&self) -> usize {
        self.data_start - 8
    }
}

/// Parsea el header JSON: tensores en orden de declaración + metadata
fn parse_header(path: &Path, bytes: &[u8]) -> Result<(Vec<TensorEntry>, Metadata)> {
    let header: serde_json::Map<String, Value> = serde_json::from_slice(bytes)
        .map_err(|e| ConvertError::malformed(path, format!("invalid header JSON: {}", e)))?;

    let mut entries = Vec::with_capacity(header.len());
    let mut metadata = Metadata::new();

    for (name, value) in header {
        if name == METADATA_KEY {
            // Único caso recuperable: metadata ilegible -> vacía + warning
            match serde_json::from_value::<Metadata>(value) {
                Ok(m) => metadata = m,
                Err(e) => log::warn!(
                    "could not read metadata for {}: {} (using empty metadata)",
                    path.display(),
                    e
                ),
            }
            continue;
        }

        if name.is_empty() {
            return Err(ConvertError::malformed(path, "empty tensor name"));
        }

        let info: RawTensorInfo = serde_json::from_value(value)
            .map_err(|e| ConvertError::malformed(path, format!("tensor '{}': {}", name, e)))?;

        entries.push(TensorEntry {
            name,
            dtype: info.dtype,
            shape: info.shape,
            data_offsets: info.data_offsets,
        });
    }

    Ok((entries, metadata))
}

/// Comprueba que los rangos cubren la región de datos sin huecos ni solapes.
///
/// Se ordena por offset: hay writers que ordenan la región de datos por
/// alineamiento y no por el orden de las claves del header.
pub fn validate_layout(entries: &[TensorEntry], data_len: usize) -> std::result::Result<(), String> {
    for e in entries {
        let [begin, end] = e.data_offsets;
        if begin > end {
            return Err(format!("tensor '{}': begin {} > end {}", e.name, begin, end));
        }
        let expected = e
            .expected_len()
            .ok_or_else(|| format!("tensor '{}': shape {:?} overflows", e.name, e.shape))?;
        if end - begin != expected {
            return Err(format!(
                "tensor '{}': {} {:?} needs {} bytes, range holds {}",
                e.name,
                e.dtype,
                e.shape,
                expected,
                end - begin
            ));
        }
    }

    let mut sorted: Vec<&TensorEntry> = entries.iter().collect();
    sorted.sort_by_key(|e| (e.data_offsets[0], e.data_offsets[1]));

    let mut cursor = 0usize;
    for e in sorted {
        let [begin, end] = e.data_offsets;
        if begin != cursor {
            let what = if begin < cursor { "overlaps" } else { "leaves a gap before" };
            return Err(format!("tensor '{}' {} offset {}", e.name, what, cursor));
        }
        cursor = end;
    }

    if cursor != data_len {
        return Err(format!(
            "tensors cover {} bytes but data region holds {}",
            cursor, data_len
        ));
    }

    Ok(())
}

/// ¿Tiene la ruta extensión .safetensors?
pub fn is_safetensors_path(path: &Path) -> bool {
    path.extension().map_or(false, |e| e == SAFETENSORS_EXT)
}
