// src/transcode/element.rs
// ============================================================================
// ELEMENT - Tipos flotantes que el transcoder sabe leer y escribir
// ============================================================================

use half::{bf16, f16};

use crate::safetensor::Dtype;

/// f64 -> f32 con redondeo a impar: si `x as f32` no es exacto, se trunca
/// hacia cero y se fuerza el bit bajo. f32 tiene al menos 2 bits más de
/// significando que BF16 y F16, así que el segundo redondeo (RNE) da el
/// mismo resultado que redondear `x` directamente.
///
/// `half::{bf16, f16}::from_f64` descartan los 32 bits bajos de la mantisa
/// antes de redondear y fallan justo por encima de un empate.
#[inline(always)]
pub(crate) fn narrow_to_odd(x: f64) -> f32 {
    let y = x as f32;
    if !y.is_finite() || y as f64 == x {
        return y;
    }
    let mut bits = y.to_bits();
    if (y as f64).abs() > x.abs() {
        bits -= 1;
    }
    f32::from_bits(bits | 1)
}

/// Un escalar flotante codificado en little-endian
pub trait Element: Copy + Send + Sync + 'static {
    const DTYPE: Dtype;
    const SIZE: usize;
    /// Todo valor del tipo es exacto en f32
    const EXACT_IN_F32: bool;

    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, out: &mut [u8]);

    fn to_f32(self) -> f32;
    fn to_f64(self) -> f64;
    /// Redondeo al más cercano, empates a par
    fn from_f32(value: f32) -> Self;
    fn from_f64(value: f64) -> Self;
}

impl Element for bf16 {
    const DTYPE: Dtype = Dtype::BF16;
    const SIZE: usize = 2;
    const EXACT_IN_F32: bool = true;

    #[inline(always)]
    fn read_le(bytes: &[u8]) -> Self {
        bf16::from_le_bytes([bytes[0], bytes[1]])
    }

    #[inline(always)]
    fn write_le(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    #[inline(always)]
    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }

    #[inline(always)]
    fn to_f64(self) -> f64 {
        bf16::to_f64(self)
    }

    #[inline(always)]
    fn from_f32(value: f32) -> Self {
        bf16::from_f32(value)
    }

    #[inline(always)]
    fn from_f64(value: f64) -> Self {
        bf16::from_f32(narrow_to_odd(value))
    }
}

impl Element for f16 {
    const DTYPE: Dtype = Dtype::F16;
    const SIZE: usize = 2;
    const EXACT_IN_F32: bool = true;

    #[inline(always)]
    fn read_le(bytes: &[u8]) -> Self {
        f16::from_le_bytes([bytes[0], bytes[1]])
    }

    #[inline(always)]
    fn write_le(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    #[inline(always)]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    #[inline(always)]
    fn to_f64(self) -> f64 {
        f16::to_f64(self)
    }

    #[inline(always)]
    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }

    #[inline(always)]
    fn from_f64(value: f64) -> Self {
        f16::from_f32(narrow_to_odd(value))
    }
}

impl Element for f32 {
    const DTYPE: Dtype = Dtype::F32;
    const SIZE: usize = 4;
    const EXACT_IN_F32: bool = true;

    #[inline(always)]
    fn read_le(bytes: &[u8]) -> Self {
        f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    #[inline(always)]
    fn write_le(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    #[inline(always)]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline(always)]
    fn to_f64(self) -> f64 {
        self as f64
    }

    #[inline(always)]
    fn from_f32(value: f32) -> Self {
        value
    }

    #[inline(always)]
    fn from_f64(value: f64) -> Self {
        value as f32
    }
}

impl Element for f64 {
    const DTYPE: Dtype = Dtype::F64;
    const SIZE: usize = 8;
    const EXACT_IN_F32: bool = false;

    #[inline(always)]
    fn read_le(bytes: &[u8]) -> Self {
        let mut b = [0u8; 8];
        b.copy_from_slice(&bytes[..8]);
        f64::from_le_bytes(b)
    }

    #[inline(always)]
    fn write_le(self, out: &mut [u8]) {
        out.copy_from_slice(&self.to_le_bytes());
    }

    #[inline(always)]
    fn to_f32(self) -> f32 {
        self as f32
    }

    #[inline(always)]
    fn to_f64(self) -> f64 {
        self
    }

    #[inline(always)]
    fn from_f32(value: f32) -> Self {
        value as f64
    }

    #[inline(always)]
    fn from_f64(value: f64) -> Self {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip<T: Element + PartialEq + std::fmt::Debug>(v: T) {
        let mut buf = vec![0u8; T::SIZE];
        v.write_le(&mut buf);
        assert_eq!(T::read_le(&buf), v);
        assert_eq!(T::DTYPE.size(), T::SIZE);
    }

    #[test]
    fn test_le_layout() {
        roundtrip(bf16::from_f32(-3.5));
        roundtrip(f16::from_f32(0.1));
        roundtrip(1.25f32);
        roundtrip(-1e300f64);

        let mut buf = [0u8; 2];
        f16::ONE.write_le(&mut buf);
        assert_eq!(buf, [0x00, 0x3C]);
        bf16::ONE.write_le(&mut buf);
        assert_eq!(buf, [0x80, 0x3F]);
    }

    #[test]
    fn test_f64_overflow_saturates() {
        assert_eq!(<f32 as Element>::from_f64(1e300), f32::INFINITY);
        assert_eq!(<f16 as Element>::from_f64(-1e300), f16::NEG_INFINITY);
        assert_eq!(<bf16 as Element>::from_f64(1e-300).to_bits(), 0);
        assert_eq!(<f16 as Element>::from_f64(-1e-300).to_bits(), 0x8000);
    }

    #[test]
    fn test_narrow_to_odd() {
        // exactos: sin tocar
        assert_eq!(narrow_to_odd(1.5), 1.5f32);
        assert_eq!(narrow_to_odd(-0.0).to_bits(), 0x8000_0000);
        assert!(narrow_to_odd(f64::NAN).is_nan());
        assert_eq!(narrow_to_odd(1e300), f32::INFINITY);

        // inexactos: truncado hacia cero con el bit bajo a 1
        let above = 1.0 + 2f64.powi(-40);
        assert_eq!(narrow_to_odd(above).to_bits(), 1.0f32.to_bits() | 1);
        let below = 1.0 - 2f64.powi(-40);
        assert_eq!(narrow_to_odd(below).to_bits(), (1.0f32.to_bits() - 1) | 1);
        assert_eq!(narrow_to_odd(-above).to_bits(), (-1.0f32).to_bits() | 1);

        // por debajo del subnormal mínimo de f32: ±subnormal mínimo
        assert_eq!(narrow_to_odd(1e-300).to_bits(), 1);
        assert_eq!(narrow_to_odd(-1e-300).to_bits(), 0x8000_0001);
    }

    #[test]
    fn test_f64_sticky_bits_past_a_tie() {
        // 1 + medio ulp + un poco: sube, aunque lo "poco" esté en los 32 bits bajos
        let f16_up = 1.0 + 2f64.powi(-11) + 2f64.powi(-40);
        assert_eq!(<f16 as Element>::from_f64(f16_up).to_f64(), 1.0 + 2f64.powi(-10));
        let bf16_up = 1.0 + 2f64.powi(-8) + 2f64.powi(-40);
        assert_eq!(<bf16 as Element>::from_f64(bf16_up).to_f64(), 1.0 + 2f64.powi(-7));

        // empate exacto: a par; un poco por debajo: baja
        assert_eq!(<f16 as Element>::from_f64(1.0 + 2f64.powi(-11)).to_f64(), 1.0);
        assert_eq!(<f16 as Element>::from_f64(1.0 + 2f64.powi(-11) - 2f64.powi(-40)).to_f64(), 1.0);
        assert_eq!(
            <f16 as Element>::from_f64(1.0 + 3.0 * 2f64.powi(-11)).to_f64(),
            1.0 + 2f64.powi(-9)
        );

        // subnormales de F16: medio subnormal mínimo + sticky -> sube
        let tie = 2f64.powi(-25);
        assert_eq!(<f16 as Element>::from_f64(tie).to_bits(), 0x0000);
        assert_eq!(<f16 as Element>::from_f64(tie + 2f64.powi(-60)).to_bits(), 0x0001);
    }
}
