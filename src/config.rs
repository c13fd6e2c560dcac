// src/config.rs
// ============================================================================
// CONFIG - Opciones de conversión
// ============================================================================

use crate::safetensor::TargetDtype;
use crate::transcode::DEFAULT_CHUNK_ELEMS;

/// Opciones compartidas por transformer, coordinador y dispatcher
#[derive(Debug, Clone)]
pub struct ConvertOptions {
    /// Precisión destino de los tensores flotantes
    pub target: TargetDtype,
    /// Hilos para convertir shards en paralelo (None = secuencial)
    pub jobs: Option<usize>,
    /// Reabrir cada salida y comprobar que respeta la entrada
    pub verify: bool,
    /// Barras de progreso y líneas [OK]
    pub progress: bool,
    /// Elementos por chunk al transcodificar en streaming
    pub chunk_elems: usize,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            target: TargetDtype::default(),
            jobs: None,
            verify: false,
            progress: false,
            chunk_elems: DEFAULT_CHUNK_ELEMS,
        }
    }
}

impl ConvertOptions {
    pub fn new(target: TargetDtype) -> Self {
        Self {
            target,
            ..Default::default()
        }
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = Some(jobs.max(1));
        self
    }

    pub fn with_verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// ¿Convertir shards en paralelo?
    pub fn parallel(&self) -> bool {
        self.jobs.map_or(false, |j| j > 1)
    }
}
