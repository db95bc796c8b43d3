//! Fixed masks and lookup tables uploaded as auxiliary buffers.
//!
//! Masks are row-major 3x3 `f32`, tables are 256 `u32` entries; both are
//! uploaded as plain native-endian words.

use crate::{DeviceError, DeviceResult};

/// 3x3 mask, row-major.
pub type Mask3 = [f32; 9];

const ZERO: Mask3 = [0.0; 9];

/// Edge and corner operators run by the `gradient` kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GradientOperator {
    Sobel,
    Prewitt,
    /// 2x2 cross operator, placed at the center and lower-right of the window.
    Roberts,
    Laplace,
    CornerDetection,
}

impl GradientOperator {
    pub const ALL: [GradientOperator; 5] =
        [Self::Sobel, Self::Prewitt, Self::Roberts, Self::Laplace, Self::CornerDetection];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Sobel => "sobel",
            Self::Prewitt => "prewitt",
            Self::Roberts => "roberts",
            Self::Laplace => "laplace",
            Self::CornerDetection => "corner_detection",
        }
    }

    /// `(mask_x, mask_y)`. Single-mask operators return an all-zero `mask_y`.
    pub fn masks(&self) -> (Mask3, Mask3) {
        match self {
            Self::Sobel => (
                [-1.0, 0.0, 1.0, -2.0, 0.0, 2.0, -1.0, 0.0, 1.0],
                [-1.0, -2.0, -1.0, 0.0, 0.0, 0.0, 1.0, 2.0, 1.0],
            ),
            Self::Prewitt => (
                [-1.0, 0.0, 1.0, -1.0, 0.0, 1.0, -1.0, 0.0, 1.0],
                [-1.0, -1.0, -1.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0],
            ),
            Self::Roberts => (
                [0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, -1.0],
                [0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, -1.0, 0.0],
            ),
            Self::Laplace => ([0.0, 1.0, 0.0, 1.0, -4.0, 1.0, 0.0, 1.0, 0.0], ZERO),
            Self::CornerDetection => ([1.0, -2.0, 1.0, -2.0, 4.0, -2.0, 1.0, -2.0, 1.0], ZERO),
        }
    }
}

/// Box mask with `center` as the middle coefficient.
pub fn mean_mask(center: f32) -> Mask3 {
    let mut mask = [1.0; 9];
    mask[4] = center;
    mask
}

/// Reciprocal of the coefficient sum, so the mask averages.
pub fn normalization(mask: &[f32]) -> DeviceResult<f32> {
    let sum: f32 = mask.iter().sum();
    if sum.abs() < f32::EPSILON {
        return Err(DeviceError::argument(1, "mask coefficients sum to zero"));
    }
    Ok(1.0 / sum)
}

/// Raw bytes of `f32` coefficients.
pub fn mask_bytes(mask: &[f32]) -> Vec<u8> {
    bytemuck::cast_slice::<f32, u8>(mask).to_vec()
}

/// 256-entry byte remap.
///
/// ```
/// use gpip_compute::LookupTable;
///
/// let lut = LookupTable::binarize(128, 0, 255);
/// assert_eq!(lut.apply(127), 0);
/// assert_eq!(lut.apply(128), 255);
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct LookupTable {
    table: [u8; 256],
}

impl LookupTable {
    pub fn identity() -> Self {
        Self::from_fn(|v| v)
    }

    /// `255 - v`.
    pub fn invert() -> Self {
        Self::from_fn(|v| 255 - v)
    }

    /// Values below `threshold` map to `low`, the rest to `high`.
    pub fn binarize(threshold: u8, low: u8, high: u8) -> Self {
        Self::from_fn(|v| if v < threshold { low } else { high })
    }

    pub fn from_fn(f: impl Fn(u8) -> u8) -> Self {
        let mut table = [0u8; 256];
        for (i, t) in table.iter_mut().enumerate() {
            *t = f(i as u8);
        }
        Self { table }
    }

    /// Table from exactly 256 entries.
    pub fn from_slice(entries: &[u8]) -> DeviceResult<Self> {
        let table: [u8; 256] = entries
            .try_into()
            .map_err(|_| DeviceError::argument(1, format!("lookup table needs 256 entries, got {}", entries.len())))?;
        Ok(Self { table })
    }

    #[inline]
    pub fn apply(&self, value: u8) -> u8 {
        self.table[value as usize]
    }

    pub fn as_slice(&self) -> &[u8; 256] {
        &self.table
    }

    /// Device layout: 256 `u32` words.
    pub fn to_device_bytes(&self) -> Vec<u8> {
        let words: Vec<u32> = self.table.iter().map(|&v| v as u32).collect();
        bytemuck::cast_slice::<u32, u8>(&words).to_vec()
    }
}

impl Default for LookupTable {
    fn default() -> Self {
        Self::identity()
    }
}

impl std::fmt::Debug for LookupTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupTable")
            .field("head", &&self.table[..8])
            .field("tail", &&self.table[248..])
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_gradient_masks_sum_to_zero() {
        for op in GradientOperator::ALL {
            let (x, y) = op.masks();
            assert_relative_eq!(x.iter().sum::<f32>(), 0.0);
            assert_relative_eq!(y.iter().sum::<f32>(), 0.0);
        }
    }

    #[test]
    fn test_single_mask_operators() {
        assert_eq!(GradientOperator::Laplace.masks().1, [0.0; 9]);
        assert_eq!(GradientOperator::CornerDetection.masks().1, [0.0; 9]);
        assert_ne!(GradientOperator::Sobel.masks().1, [0.0; 9]);
    }

    #[test]
    fn test_mean_normalization() {
        assert_relative_eq!(normalization(&mean_mask(1.0)).unwrap(), 1.0 / 9.0);
        assert_relative_eq!(normalization(&mean_mask(0.0)).unwrap(), 1.0 / 8.0);
        assert_relative_eq!(normalization(&mean_mask(4.0)).unwrap(), 1.0 / 12.0);
        assert!(normalization(&mean_mask(-8.0)).is_err());
    }

    #[test]
    fn test_lut_constructors() {
        let inv = LookupTable::invert();
        assert_eq!(inv.apply(0), 255);
        assert_eq!(inv.apply(200), 55);
        for v in 0..=255u8 {
            assert_eq!(inv.apply(inv.apply(v)), v);
            assert_eq!(LookupTable::identity().apply(v), v);
        }
        assert!(LookupTable::from_slice(&[0; 255]).is_err());
        assert_eq!(LookupTable::from_slice(&[7; 256]).unwrap().apply(3), 7);
    }

    #[test]
    #[cfg(target_endian = "little")]
    fn test_device_layout() {
        let bytes = LookupTable::invert().to_device_bytes();
        assert_eq!(bytes.len(), 1024);
        assert_eq!(&bytes[..8], &[255, 0, 0, 0, 254, 0, 0, 0]);

        let mask = mask_bytes(&[1.0, -1.0]);
        assert_eq!(mask, [0, 0, 0x80, 0x3f, 0, 0, 0x80, 0xbf]);
    }
}
