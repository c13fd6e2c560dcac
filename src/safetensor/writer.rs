// src/safetensor/writer.rs
// ============================================================================
// SAFETENSOR WRITER - Construye archivos .safetensors
// ============================================================================
//
// Flujo:
//   1. create(): calcula offsets frescos (payloads contiguos en el orden
//      recibido), escribe header_len + header JSON en un temporal
//   2. write_tensor() / write_tensor_with(): un payload por tensor, en orden
//   3. finalize(): comprueba que no falta nada y renombra al destino
//
// El header se rellena con espacios hasta múltiplo de 8 para que la región
// de datos quede alineada.
//
// ============================================================================

use std::collections::HashSet;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use serde_json::{json, Map, Value};

use super::{Metadata, TensorEntry, METADATA_KEY};
use crate::atomic::AtomicFile;
use crate::error::{ConvertError, IoContext, Result};

const HEADER_ALIGNMENT: usize = 8;

/// Recalcula `data_offsets` colocando los payloads uno tras otro
pub fn plan_layout(path: &Path, entries: &[TensorEntry]) -> Result<Vec<TensorEntry>> {
    let mut seen = HashSet::with_capacity(entries.len());
    let mut cursor = 0usize;
    let mut planned = Vec::with_capacity(entries.len());

    for entry in entries {
        if entry.name.is_empty() || entry.name == METADATA_KEY {
            return Err(ConvertError::malformed(
                path,
                format!("invalid tensor name '{}'", entry.name),
            ));
        }
        if !seen.insert(entry.name.as_str()) {
            return Err(ConvertError::malformed(
                path,
                format!("duplicate tensor name '{}'", entry.name),
            ));
        }

        let len = entry.expected_len().ok_or_else(|| {
            ConvertError::malformed(path, format!("tensor '{}': shape overflows", entry.name))
        })?;

        let mut e = entry.clone();
        e.data_offsets = [cursor, cursor + len];
        cursor += len;
        planned.push(e);
    }

    Ok(planned)
}

/// Serializa el header (metadata primero) con padding de espacios
pub fn encode_header(entries: &[TensorEntry], metadata: &Metadata) -> Result<Vec<u8>> {
    let mut header = Map::new();

    if !metadata.is_empty() {
        let meta: Map<String, Value> = metadata
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        header.insert(METADATA_KEY.to_string(), Value::Object(meta));
    }

    for e in entries {
        header.insert(
            e.name.clone(),
            json!({
                "dtype": e.dtype.as_str(),
                "shape": e.shape,
                "data_offsets": e.data_offsets,
            }),
        );
    }

    let mut bytes = serde_json::to_vec(&Value::Object(header))
        .map_err(|e| ConvertError::malformed("<header>", e.to_string()))?;

    let remainder = bytes.len() % HEADER_ALIGNMENT;
    if remainder != 0 {
        bytes.resize(bytes.len() + HEADER_ALIGNMENT - remainder, b' ');
    }

    Ok(bytes)
}

/// Cuenta bytes escritos por un productor de payload
struct CountingWriter<'a, W: Write> {
    inner: &'a mut W,
    count: usize,
}

impl<W: Write> Write for CountingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Builder de archivos safetensor (escritura atómica)
pub struct SafetensorWriter {
    path: PathBuf,
    file: BufWriter<AtomicFile>,
    entries: Vec<TensorEntry>,
    next: usize,
}

impl SafetensorWriter {
    /// Crea el temporal y escribe el header. Los offsets de `entries` se
    /// ignoran y se recalculan.
    pub fn create(
        path: impl AsRef<Path>,
        entries: &[TensorEntry],
        metadata: &Metadata,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = plan_layout(&path, entries)?;
        let header = encode_header(&entries, metadata)?;

        let mut file = BufWriter::with_capacity(1 << 20, AtomicFile::create(&path)?);
        file.write_u64::<LittleEndian>(header.len() as u64).at(&path)?;
        file.write_all(&header).at(&path)?;

        Ok(Self {
            path,
            file,
            entries,
            next: 0,
        })
    }

    /// Siguiente tensor pendiente de escribir
    pub fn next_entry(&self) -> Option<&TensorEntry> {
        self.entries.get(self.next)
    }

    /// Escribe el payload del siguiente tensor desde un productor en streaming.
    /// El productor debe escribir exactamente los bytes declarados.
    pub fn write_tensor_with<F>(&mut self, produce: F) -> Result<()>
    where
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        let (name, expected) = match self.next_entry() {
            Some(e) => (e.name.clone(), e.byte_len()),
            None => {
                return Err(ConvertError::malformed(
                    &self.path,
                    "more payloads than declared tensors",
                ))
            }
        };

        let mut sink = CountingWriter {
            inner: &mut self.file,
            count: 0,
        };
        produce(&mut sink)?;

        if sink.count != expected {
            return Err(ConvertError::malformed(
                &self.path,
                format!(
                    "tensor '{}': wrote {} bytes, expected {}",
                    name, sink.count, expected
                ),
            ));
        }

        self.next += 1;
        Ok(())
    }

    pub fn write_tensor(&mut self, data: &[u8]) -> Result<()> {
        let path = self.path.clone();
        self.write_tensor_with(|w| w.write_all(data).at(&path))
    }

    /// Cierra el archivo y lo mueve a su ruta final. Devuelve bytes de datos.
    pub fn finalize(self) -> Result<u64> {
        let (file, data_len) = self.stage()?;
        file.commit()?;
        Ok(data_len)
    }

    /// Como `finalize`, pero deja el archivo completo en su temporal sin
    /// publicarlo. Si el `AtomicFile` se descarta, el temporal se borra.
    pub fn stage(self) -> Result<(AtomicFile, u64)> {
        if self.next != self.entries.len() {
            return Err(ConvertError::malformed(
                &self.path,
                format!(
                    "only {} of {} tensors were written",
                    self.next,
                    self.entries.len()
                ),
            ));
        }

        let data_len = self.entries.last().map_or(0, |e| e.data_offsets[1]) as u64;

        let file = self
            .file
            .into_inner()
            .map_err(|e| e.into_error())
            .at(&self.path)?;

        Ok((file, data_len))
    }
}

/// Escribe un archivo completo: `produce(i, entry, sink)` emite el payload
/// del tensor `i` en el orden de `entries`.
pub fn write_safetensors<F>(
    path: impl AsRef<Path>,
    entries: &[TensorEntry],
    metadata: &Metadata,
    mut produce: F,
) -> Result<u64>
where
    F: FnMut(usize, &TensorEntry, &mut dyn Write) -> Result<()>,
{
    let mut writer = SafetensorWriter::create(path, entries, metadata)?;
    for (i, entry) in entries.iter().enumerate() {
        writer.write_tensor_with(|sink| produce(i, entry, sink))?;
    }
    writer.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safetensor::{Dtype, SafetensorFile};

    #[test]
    fn test_write_then_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.safetensors");

        let entries = vec![
            TensorEntry::new("w", Dtype::F16, vec![2, 2]),
            TensorEntry::new("ids", Dtype::I64, vec![3]),
            TensorEntry::new("flag", Dtype::BOOL, vec![]),
        ];
        let payloads: Vec<Vec<u8>> = vec![
            (0..8).collect(),
            [1i64, 2, 3].iter().flat_map(|v| v.to_le_bytes()).collect(),
            vec![1],
        ];
        let mut metadata = Metadata::new();
        metadata.insert("format".to_string(), "pt".to_string());

        let data_len = write_safetensors(&path, &entries, &metadata, |i, _, sink| {
            sink.write_all(&payloads[i]).at("sink")
        })
        .unwrap();
        assert_eq!(data_len, 8 + 24 + 1);

        let file = SafetensorFile::open(&path).unwrap();
        assert_eq!(file.metadata(), &metadata);
        let names: Vec<_> = file.tensor_entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["w", "ids", "flag"]);
        for (entry, expected) in file.tensor_entries().iter().zip(&payloads) {
            assert_eq!(file.read_payload(entry).unwrap(), expected.as_slice());
        }
        assert_eq!(file.header_len() % 8, 0);
    }

    #[test]
    fn test_header_metadata_first() {
        let entries = plan_layout(Path::new("x"), &[TensorEntry::new("a", Dtype::U8, vec![1])]).unwrap();
        let mut metadata = Metadata::new();
        metadata.insert("k".to_string(), "v".to_string());

        let header = encode_header(&entries, &metadata).unwrap();
        let text = String::from_utf8(header).unwrap();
        assert!(text.starts_with(r#"{"__metadata__":{"k":"v"},"a":"#));
        assert_eq!(text.len() % 8, 0);
    }

    #[test]
    fn test_plan_layout_recomputes_offsets() {
        let mut a = TensorEntry::new("a", Dtype::F32, vec![3]);
        a.data_offsets = [100, 112];
        let b = TensorEntry::new("b", Dtype::U16, vec![2, 2]);

        let planned = plan_layout(Path::new("x"), &[a, b]).unwrap();
        assert_eq!(planned[0].data_offsets, [0, 12]);
        assert_eq!(planned[1].data_offsets, [12, 20]);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let dup = [
            TensorEntry::new("a", Dtype::U8, vec![1]),
            TensorEntry::new("a", Dtype::U8, vec![1]),
        ];
        let err = plan_layout(Path::new("x"), &dup).unwrap_err();
        assert_eq!(err.kind(), "MalformedArchive");

        let reserved = [TensorEntry::new(METADATA_KEY, Dtype::U8, vec![1])];
        assert!(plan_layout(Path::new("x"), &reserved).is_err());
    }

    #[test]
    fn test_short_payload_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.safetensors");

        let entries = [TensorEntry::new("a", Dtype::F32, vec![4])];
        let err = write_safetensors(&path, &entries, &Metadata::new(), |_, _, sink| {
            sink.write_all(&[0u8; 12]).at("sink")
        })
        .unwrap_err();

        assert_eq!(err.kind(), "MalformedArchive");
        assert!(!path.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_finalize_requires_all_tensors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.safetensors");

        let entries = [
            TensorEntry::new("a", Dtype::U8, vec![1]),
            TensorEntry::new("b", Dtype::U8, vec![1]),
        ];
        let mut writer = SafetensorWriter::create(&path, &entries, &Metadata::new()).unwrap();
        writer.write_tensor(&[1]).unwrap();
        assert_eq!(writer.next_entry().map(|e| e.name.as_str()), Some("b"));

        assert!(writer.finalize().is_err());
        assert!(!path.exists());
    }
}
