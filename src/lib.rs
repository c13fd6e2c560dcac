// src/lib.rs
// ============================================================================
// HALFCAST - Conversor de precisión para Safetensors (BF16 <-> FP16)
// ============================================================================
//
// Entradas: un .safetensors, un model.safetensors.index.json o un
// directorio con ambos. Los tensores flotantes (F64, F32, F16, BF16) pasan
// a la precisión destino; el resto se copia byte a byte.
//
// ============================================================================

pub mod atomic;
pub mod batch;
pub mod builder;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod index;
pub mod inspect;
pub mod safetensor;
pub mod transcode;
pub mod verify;

#[cfg(test)]
mod testing;

// Re-exports principales
pub use builder::{convert_file, ConvertStats};
pub use config::ConvertOptions;
pub use dispatch::{classify, convert_path, InputKind};
pub use error::{ConvertError, Result};
pub use index::{convert_index, ShardIndex};
pub use inspect::dtype_histogram;
pub use safetensor::{Dtype, SafetensorFile, SafetensorWriter, TargetDtype, TensorEntry};
