// src/error.rs
// ============================================================================
// ERRORES - Taxonomía de fallos del conversor
// ============================================================================

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errores de conversión
#[derive(Debug, Error)]
pub enum ConvertError {
    /// La ruta de entrada no se puede clasificar o los argumentos no cuadran
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Header ilegible, offsets inconsistentes, dtype desconocido...
    #[error("malformed archive {}: {reason}", path.display())]
    MalformedArchive { path: PathBuf, reason: String },

    /// Dtype flotante que el transcoder no sabe convertir
    #[error("unsupported dtype: {0}")]
    UnsupportedDtype(String),

    /// El index referencia un shard que no existe
    #[error("missing shard {} referenced by {}", shard.display(), index.display())]
    MissingShard { index: PathBuf, shard: PathBuf },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ConvertError {
    pub fn malformed(path: impl AsRef<Path>, reason: impl Into<String>) -> Self {
        Self::MalformedArchive {
            path: path.as_ref().to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Nombre corto del tipo de error (para diagnósticos)
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "InvalidInput",
            Self::MalformedArchive { .. } => "MalformedArchive",
            Self::UnsupportedDtype(_) => "UnsupportedDtype",
            Self::MissingShard { .. } => "MissingShard",
            Self::Io { .. } => "IoError",
        }
    }
}

pub type Result<T> = std::result::Result<T, ConvertError>;

/// Adjunta la ruta a un `io::Result`, al estilo `with_context`
pub trait IoContext<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T>;
}

impl<T> IoContext<T> for io::Result<T> {
    fn at(self, path: impl AsRef<Path>) -> Result<T> {
        self.map_err(|source| ConvertError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        })
    }
}
