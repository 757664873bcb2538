//! Flattened feature sequences with their padding masks.
use crate::{Error, Result};
use candle::{DType, Tensor};

/// A `(batch, hidden, length)` feature tensor together with a `(batch, length)` mask, `1` marking
/// positions that must not be attended to.
#[derive(Debug, Clone)]
pub struct FeatureStream {
    features: Tensor,
    mask: Tensor,
}

impl FeatureStream {
    pub fn new(features: Tensor, mask: Tensor) -> Result<Self> {
        let (b_sz, _hidden, len) = features.dims3()?;
        if mask.dims() != [b_sz, len] {
            return Err(Error::ShapeMismatch {
                op: "feature-stream",
                features: features.shape().clone(),
                mask: mask.shape().clone(),
            });
        }
        let mask = mask.to_dtype(DType::U8)?;
        Ok(Self { features, mask })
    }

    /// A stream where every position carries information, e.g. projected location features.
    pub fn unmasked(features: Tensor) -> Result<Self> {
        let (b_sz, _hidden, len) = features.dims3()?;
        let mask = Tensor::zeros((b_sz, len), DType::U8, features.device())?;
        Self::new(features, mask)
    }

    pub fn features(&self) -> &Tensor {
        &self.features
    }

    pub fn mask(&self) -> &Tensor {
        &self.mask
    }

    pub fn len(&self) -> usize {
        self.mask.dims()[1]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn batch_size(&self) -> usize {
        self.mask.dims()[0]
    }

    /// Appends `other` after the positions of `self` along the length axis.
    pub fn concat(&self, other: &FeatureStream) -> Result<Self> {
        let features = Tensor::cat(&[&self.features, &other.features], 2)?;
        let mask = Tensor::cat(&[&self.mask, &other.mask], 1)?;
        Self::new(features, mask)
    }

    /// Unmasks the first position of every sample whose positions are all padding, so that
    /// attention over this stream always has at least one valid key.
    pub fn ensure_unmasked(&self) -> Result<Self> {
        let mask = ensure_unmasked_values(&self.mask)?;
        Ok(Self {
            features: self.features.clone(),
            mask,
        })
    }

    /// The features in `(batch, length, hidden)` layout as consumed by attention layers.
    pub fn sequence_first(&self) -> Result<Tensor> {
        Ok(self.features.transpose(1, 2)?.contiguous()?)
    }
}

pub fn ensure_unmasked_values(mask: &Tensor) -> Result<Tensor> {
    let (_b_sz, len) = mask.dims2()?;
    if len == 0 {
        return Err(Error::EmptyStream {
            op: "ensure-unmasked",
        });
    }
    let device = mask.device();
    // 1 for the samples where every position is padding.
    let fully_masked = mask.min_keepdim(1)?;
    let first: Vec<u8> = (0..len).map(|i| u8::from(i == 0)).collect();
    let first = Tensor::from_vec(first, (1, len), device)?;
    let fix = fully_masked.broadcast_mul(&first)?;
    Ok(mask.sub(&fix)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;

    #[test]
    fn unmasks_only_fully_padded_samples() -> Result<()> {
        let dev = Device::Cpu;
        let mask = Tensor::new(&[[1u8, 1, 1], [0, 1, 1], [1, 1, 0]], &dev)?;
        let mask = ensure_unmasked_values(&mask)?.to_vec2::<u8>()?;
        assert_eq!(mask, [[0, 1, 1], [0, 1, 1], [1, 1, 0]]);
        Ok(())
    }

    #[test]
    fn concat_keeps_order_and_length() -> Result<()> {
        let dev = Device::Cpu;
        let a = FeatureStream::new(
            Tensor::zeros((2, 4, 3), DType::F32, &dev)?,
            Tensor::ones((2, 3), DType::U8, &dev)?,
        )?;
        let b = FeatureStream::unmasked(Tensor::ones((2, 4, 1), DType::F32, &dev)?)?;
        let c = a.concat(&b)?;
        assert_eq!(c.len(), 4);
        assert_eq!(c.features().dims(), &[2, 4, 4]);
        assert_eq!(c.mask().to_vec2::<u8>()?, [[1, 1, 1, 0], [1, 1, 1, 0]]);
        Ok(())
    }

    #[test]
    fn rejects_length_mismatch() -> Result<()> {
        let dev = Device::Cpu;
        let err = FeatureStream::new(
            Tensor::zeros((2, 4, 3), DType::F32, &dev)?,
            Tensor::zeros((2, 5), DType::U8, &dev)?,
        )
        .unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
        Ok(())
    }
}
