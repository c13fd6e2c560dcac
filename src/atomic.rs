// src/atomic.rs
// ============================================================================
// ATOMIC - Escritura temp + rename y cancelación gruesa
// ============================================================================
//
// Todo fichero de salida se escribe primero en un temporal hermano
// (".halfcast-XXXX.tmp" en el mismo directorio) y se renombra al final.
// Un crash nunca deja un archivo a medias en la ruta final.
//
// Los temporales en vuelo se registran; ante SIGINT se borran y el
// proceso sale con 130. Los outputs ya renombrados se conservan.
//
// ============================================================================

use std::collections::HashSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use tempfile::NamedTempFile;

use crate::error::{IoContext, Result};

fn in_flight() -> &'static Mutex<HashSet<PathBuf>> {
    static IN_FLIGHT: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    IN_FLIGHT.get_or_init(|| Mutex::new(HashSet::new()))
}

fn register(path: &Path) {
    if let Ok(mut set) = in_flight().lock() {
        set.insert(path.to_path_buf());
    }
}

fn unregister(path: &Path) {
    if let Ok(mut set) = in_flight().lock() {
        set.remove(path);
    }
}

/// Borra todos los temporales en vuelo. Devuelve cuántos se borraron.
pub fn remove_in_flight() -> usize {
    let paths: Vec<PathBuf> = match in_flight().lock() {
        Ok(mut set) => set.drain().collect(),
        Err(_) => return 0,
    };
    paths
        .iter()
        .filter(|p| std::fs::remove_file(p).is_ok())
        .count()
}

/// Instala el handler de SIGINT (una vez por proceso)
pub fn install_interrupt_handler() -> std::result::Result<(), ctrlc::Error> {
    ctrlc::set_handler(|| {
        let removed = remove_in_flight();
        eprintln!("\n[INTERRUPTED] removed {} temporary file(s)", removed);
        std::process::exit(130);
    })
}

/// Mantiene un temporal en el registro mientras vive
struct InFlight(PathBuf);

impl Drop for InFlight {
    fn drop(&mut self) {
        unregister(&self.0);
    }
}

/// Fichero de salida que sólo aparece en `dest` tras `commit()`.
/// Si se descarta sin commit, NamedTempFile borra el temporal.
pub struct AtomicFile {
    tmp: NamedTempFile,
    dest: PathBuf,
    _in_flight: InFlight,
}

impl AtomicFile {
    pub fn create(dest: impl AsRef<Path>) -> Result<Self> {
        let dest = dest.as_ref().to_path_buf();
        let dir = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let tmp = tempfile::Builder::new()
            .prefix(".halfcast-")
            .suffix(".tmp")
            .tempfile_in(&dir)
            .at(&dir)?;
        register(tmp.path());
        let in_flight = InFlight(tmp.path().to_path_buf());

        Ok(Self {
            tmp,
            dest,
            _in_flight: in_flight,
        })
    }

    pub fn temp_path(&self) -> &Path {
        self.tmp.path()
    }

    /// Renombra el temporal a su destino final
    pub fn commit(self) -> Result<()> {
        let Self { tmp, dest, _in_flight } = self;
        let tmp_path = tmp.path().to_path_buf();

        tmp.as_file().sync_all().at(&tmp_path)?;

        // NamedTempFile crea con 0600
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o644))
                .at(&tmp_path)?;
        }

        tmp.persist(&dest).map_err(|e| e.error).at(&dest)?;
        Ok(())
    }
}

impl Write for AtomicFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tmp.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.tmp.flush()
    }
}

/// Escribe `contents` en `dest` de forma atómica
pub fn write_atomic(dest: impl AsRef<Path>, contents: &[u8]) -> Result<()> {
    let mut file = AtomicFile::create(dest)?;
    let tmp_path = file.temp_path().to_path_buf();
    file.write_all(contents).at(&tmp_path)?;
    file.commit()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leftovers(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.to_string_lossy().ends_with(".tmp"))
            .collect()
    }

    #[test]
    fn test_commit_moves_into_place() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");

        write_atomic(&dest, b"hello").unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"hello");
        assert!(leftovers(dir.path()).is_empty());
    }

    #[test]
    fn test_drop_without_commit_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.bin");
        {
            let mut file = AtomicFile::create(&dest).unwrap();
            file.write_all(b"partial").unwrap();
            assert!(file.temp_path().exists());
        }
        assert!(!dest.exists());
        assert!(leftovers(dir.path()).is_empty());
    }

    #[test]
    fn test_in_flight_registry() {
        let dir = tempfile::tempdir().unwrap();
        let file = AtomicFile::create(dir.path().join("x.bin")).unwrap();
        let tmp = file.temp_path().to_path_buf();
        assert!(in_flight().lock().unwrap().contains(&tmp));

        file.commit().unwrap();
        assert!(!in_flight().lock().unwrap().contains(&tmp));
    }
}
