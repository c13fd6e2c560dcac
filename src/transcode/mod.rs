// src/transcode/mod.rs
// ============================================================================
// TRANSCODE - Re-codificación elemento a elemento entre dtypes flotantes
// ============================================================================
//
// Tipos reconocidos: BF16, F16, F32, F64.
//
// Semántica (por elemento, sobre el valor real que representa):
//   - finito -> valor más cercano en destino, round-half-to-even
//   - |x| > max finito del destino -> ±inf
//   - por debajo del subnormal mínimo -> ±0 (también RNE)
//   - ±inf -> ±inf, NaN -> NaN quiet, ±0 se conserva
//   - S == T -> copia
//
// Un único redondeo: BF16/F16/F32 son exactos en f32, F64 pasa por f64.
// Los bucles se monomorfizan por par (S, T).
//
// ============================================================================

pub mod element;

use rayon::prelude::*;

use crate::error::{ConvertError, Result};
use crate::safetensor::Dtype;

pub use element::Element;
use half::{bf16, f16};

/// Elementos por bloque al paralelizar con rayon
const PAR_BLOCK_ELEMS: usize = 64 * 1024;

/// Por debajo de esto no compensa repartir entre hilos
const PAR_THRESHOLD_ELEMS: usize = 4 * PAR_BLOCK_ELEMS;

/// Elementos por chunk en modo streaming
pub const DEFAULT_CHUNK_ELEMS: usize = 1 << 20;

/// ¿Sabe el transcoder leer/escribir este dtype?
pub fn is_supported(dtype: Dtype) -> bool {
    matches!(dtype, Dtype::BF16 | Dtype::F16 | Dtype::F32 | Dtype::F64)
}

fn check_supported(dtype: Dtype) -> Result<()> {
    if is_supported(dtype) {
        Ok(())
    } else {
        Err(ConvertError::UnsupportedDtype(format!(
            "{} cannot be transcoded (supported: BF16, F16, F32, F64)",
            dtype
        )))
    }
}

#[inline(always)]
fn convert<S: Element, T: Element>(value: S) -> T {
    if S::EXACT_IN_F32 {
        let x = value.to_f32();
        if x.is_nan() {
            T::from_f32(f32::NAN.copysign(x))
        } else {
            T::from_f32(x)
        }
    } else {
        let x = value.to_f64();
        if x.is_nan() {
            T::from_f64(f64::NAN.copysign(x))
        } else {
            T::from_f64(x)
        }
    }
}

#[inline]
fn convert_block<S: Element, T: Element>(input: &[u8], output: &mut [u8]) {
    for (src, dst) in input
        .chunks_exact(S::SIZE)
        .zip(output.chunks_exact_mut(T::SIZE))
    {
        convert::<S, T>(S::read_le(src)).write_le(dst);
    }
}

fn convert_slice<S: Element, T: Element>(input: &[u8], output: &mut [u8]) {
    let numel = input.len() / S::SIZE;
    if numel < PAR_THRESHOLD_ELEMS {
        convert_block::<S, T>(input, output);
        return;
    }

    input
        .par_chunks(PAR_BLOCK_ELEMS * S::SIZE)
        .zip(output.par_chunks_mut(PAR_BLOCK_ELEMS * T::SIZE))
        .for_each(|(src, dst)| convert_block::<S, T>(src, dst));
}

fn with_target<S: Element>(dst: Dtype, input: &[u8], output: &mut [u8]) -> Result<()> {
    match dst {
        Dtype::BF16 => convert_slice::<S, bf16>(input, output),
        Dtype::F16 => convert_slice::<S, f16>(input, output),
        Dtype::F32 => convert_slice::<S, f32>(input, output),
        Dtype::F64 => convert_slice::<S, f64>(input, output),
        other => return check_supported(other),
    }
    Ok(())
}

/// Transcodifica `input` (elementos `src`) sobre `output` (elementos `dst`)
pub fn transcode_into(src: Dtype, dst: Dtype, input: &[u8], output: &mut [u8]) -> Result<()> {
    check_supported(src)?;
    check_supported(dst)?;

    if input.len() % src.size() != 0 {
        return Err(ConvertError::InvalidInput(format!(
            "{} bytes is not a whole number of {} elements",
            input.len(),
            src
        )));
    }
    let numel = input.len() / src.size();
    if output.len() != numel * dst.size() {
        return Err(ConvertError::InvalidInput(format!(
            "output buffer holds {} bytes, {} {} elements need {}",
            output.len(),
            numel,
            dst,
            numel * dst.size()
        )));
    }

    if src == dst {
        output.copy_from_slice(input);
        return Ok(());
    }

    match src {
        Dtype::BF16 => with_target::<bf16>(dst, input, output),
        Dtype::F16 => with_target::<f16>(dst, input, output),
        Dtype::F32 => with_target::<f32>(dst, input, output),
        Dtype::F64 => with_target::<f64>(dst, input, output),
        other => check_supported(other),
    }
}

/// Transcodifica a un buffer nuevo
pub fn transcode(src: Dtype, dst: Dtype, input: &[u8]) -> Result<Vec<u8>> {
    let numel = input.len() / src.size();
    let mut output = vec![0u8; numel * dst.size()];
    transcode_into(src, dst, input, &mut output)?;
    Ok(output)
}

/// Transcodifica por chunks de `chunk_elems` elementos y entrega cada chunk
/// convertido a `emit`. Memoria acotada a un chunk de salida.
pub fn transcode_stream<F>(
    src: Dtype,
    dst: Dtype,
    input: &[u8],
    chunk_elems: usize,
    mut emit: F,
) -> Result<()>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    check_supported(src)?;
    check_supported(dst)?;

    let chunk_elems = chunk_elems.max(1);
    let mut buf = vec![0u8; chunk_elems.min(input.len() / src.size()) * dst.size()];

    for chunk in input.chunks(chunk_elems * src.size()) {
        let out_len = chunk.len() / src.size() * dst.size();
        transcode_into(src, dst, chunk, &mut buf[..out_len])?;
        emit(&buf[..out_len])?;
    }
    Ok(())
}
