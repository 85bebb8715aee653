use crate::{Result, SfmError};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use wide::f32x8;

/// The number of descriptor components processed per vector operation.
pub const LANES: usize = 8;

/// An element type of a quantized or floating point descriptor.
///
/// Descriptors are expected to be unit length after dividing every component by
/// [`DescriptorElement::NORMALIZATION`].
pub trait DescriptorElement: Copy + Debug + PartialEq + Send + Sync + 'static {
    /// The type used to accumulate inner products and squared distances.
    type Distance: Copy + Debug + PartialOrd + Send + Sync;

    /// The value a component takes when the descriptor is a unit basis vector.
    const NORMALIZATION: f64;

    /// Loads exactly [`LANES`] elements into a vector register.
    fn lanes(chunk: &[Self]) -> f32x8;

    /// Computes the inner product of two descriptors of equal length.
    ///
    /// The length must be a multiple of [`LANES`].
    fn inner_product(a: &[Self], b: &[Self]) -> Self::Distance;

    /// Combines the squared norms and the inner product into a squared distance.
    fn squared_distance(
        query_norm: Self::Distance,
        candidate_norm: Self::Distance,
        inner: Self::Distance,
    ) -> Self::Distance;

    /// Converts a squared distance into the squared distance of unit descriptors.
    fn unit_distance(distance: Self::Distance) -> f64;
}

macro_rules! integer_element {
    ($ty:ty, $norm:expr) => {
        impl DescriptorElement for $ty {
            type Distance = i64;

            const NORMALIZATION: f64 = $norm;

            fn lanes(chunk: &[Self]) -> f32x8 {
                f32x8::new([
                    chunk[0] as f32,
                    chunk[1] as f32,
                    chunk[2] as f32,
                    chunk[3] as f32,
                    chunk[4] as f32,
                    chunk[5] as f32,
                    chunk[6] as f32,
                    chunk[7] as f32,
                ])
            }

            fn inner_product(a: &[Self], b: &[Self]) -> i64 {
                // Each chunk is reduced on its own so the float sum stays exact
                // for components within the normalization range.
                a.chunks_exact(LANES)
                    .zip(b.chunks_exact(LANES))
                    .map(|(a, b)| (Self::lanes(a) * Self::lanes(b)).reduce_add() as i64)
                    .sum()
            }

            fn squared_distance(query_norm: i64, candidate_norm: i64, inner: i64) -> i64 {
                query_norm + candidate_norm - 2 * inner
            }

            fn unit_distance(distance: i64) -> f64 {
                distance as f64 / (Self::NORMALIZATION * Self::NORMALIZATION)
            }
        }
    };
}

integer_element!(i16, 127.0);
integer_element!(u16, 255.0);

impl DescriptorElement for f32 {
    type Distance = f32;

    const NORMALIZATION: f64 = 1.0;

    fn lanes(chunk: &[Self]) -> f32x8 {
        f32x8::new([
            chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
        ])
    }

    fn inner_product(a: &[Self], b: &[Self]) -> f32 {
        a.chunks_exact(LANES)
            .zip(b.chunks_exact(LANES))
            .fold(f32x8::splat(0.), |acc, (a, b)| {
                Self::lanes(a).mul_add(Self::lanes(b), acc)
            })
            .reduce_add()
    }

    fn squared_distance(query_norm: f32, candidate_norm: f32, inner: f32) -> f32 {
        query_norm + candidate_norm - 2.0 * inner
    }

    fn unit_distance(distance: f32) -> f64 {
        distance as f64
    }
}

/// Checks that `dim` can be processed by the vectorized kernels.
pub fn check_dimension(dim: usize) -> Result<()> {
    if dim == 0 || dim % LANES != 0 {
        Err(SfmError::InvalidDimension(dim, LANES))
    } else {
        Ok(())
    }
}

/// All descriptors of one viewport stored contiguously, `dim` components each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DescriptorSet {
    I16 { dim: usize, data: Vec<i16> },
    U16 { dim: usize, data: Vec<u16> },
    F32 { dim: usize, data: Vec<f32> },
}

impl DescriptorSet {
    /// Quantizes unit length float descriptors to the signed 16 bit encoding.
    pub fn quantize_i16(dim: usize, data: &[f32]) -> Self {
        Self::I16 {
            dim,
            data: data
                .iter()
                .map(|&v| (v as f64 * i16::NORMALIZATION).round() as i16)
                .collect(),
        }
    }

    pub fn dim(&self) -> usize {
        match *self {
            Self::I16 { dim, .. } | Self::U16 { dim, .. } | Self::F32 { dim, .. } => dim,
        }
    }

    fn data_len(&self) -> usize {
        match self {
            Self::I16 { data, .. } => data.len(),
            Self::U16 { data, .. } => data.len(),
            Self::F32 { data, .. } => data.len(),
        }
    }

    /// The number of descriptors in the set.
    pub fn len(&self) -> usize {
        match self.dim() {
            0 => 0,
            dim => self.data_len() / dim,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validates the dimension and the block length.
    pub fn validate(&self) -> Result<()> {
        check_dimension(self.dim())?;
        if self.data_len() % self.dim() != 0 {
            return Err(SfmError::BlockLengthMismatch {
                len: self.data_len(),
                dim: self.dim(),
            });
        }
        Ok(())
    }
}
