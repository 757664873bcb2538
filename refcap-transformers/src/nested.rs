//! Batches of images with different spatial sizes.
//!
//! Images are zero padded at the bottom and on the right up to the largest height and width of
//! the batch. The accompanying `u8` mask is `1` on padded pixels and `0` on real ones.
use crate::{Error, Result};
use candle::{DType, Device, Tensor};

#[derive(Debug, Clone)]
pub struct NestedTensor {
    tensors: Tensor,
    mask: Tensor,
}

impl NestedTensor {
    /// Wraps an already padded `(batch, channels, height, width)` tensor with its
    /// `(batch, height, width)` padding mask.
    pub fn new(tensors: Tensor, mask: Tensor) -> Result<Self> {
        let (b_sz, _c, h, w) = tensors.dims4()?;
        if mask.dims() != [b_sz, h, w] {
            return Err(Error::ShapeMismatch {
                op: "nested-tensor",
                features: tensors.shape().clone(),
                mask: mask.shape().clone(),
            });
        }
        let mask = mask.to_dtype(DType::U8)?;
        Ok(Self { tensors, mask })
    }

    /// Pads a list of `(channels, height, width)` images to a common size and stacks them.
    pub fn from_tensor_list(images: &[Tensor]) -> Result<Self> {
        let first = images.first().ok_or(Error::EmptyBatch)?;
        let device = first.device();
        let (channels, _, _) = first.dims3()?;
        let mut max_h = 0;
        let mut max_w = 0;
        for image in images.iter() {
            let (c, h, w) = image.dims3()?;
            if c != channels {
                let msg = format!("inconsistent number of channels in batch, {channels} <> {c}");
                return Err(candle::Error::Msg(msg).into());
            }
            max_h = max_h.max(h);
            max_w = max_w.max(w);
        }
        let mut padded = Vec::with_capacity(images.len());
        let mut masks = Vec::with_capacity(images.len());
        for image in images.iter() {
            let (_, h, w) = image.dims3()?;
            let image = image
                .pad_with_zeros(1, 0, max_h - h)?
                .pad_with_zeros(2, 0, max_w - w)?;
            padded.push(image);
            masks.push(padding_mask(h, w, max_h, max_w, device)?);
        }
        let tensors = Tensor::stack(&padded, 0)?;
        let mask = Tensor::stack(&masks, 0)?;
        Ok(Self { tensors, mask })
    }

    pub fn tensors(&self) -> &Tensor {
        &self.tensors
    }

    pub fn mask(&self) -> &Tensor {
        &self.mask
    }

    pub fn decompose(&self) -> (&Tensor, &Tensor) {
        (&self.tensors, &self.mask)
    }

    pub fn batch_size(&self) -> usize {
        self.mask.dims()[0]
    }

    pub fn device(&self) -> &Device {
        self.tensors.device()
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            tensors: self.tensors.to_device(device)?,
            mask: self.mask.to_device(device)?,
        })
    }
}

fn padding_mask(h: usize, w: usize, max_h: usize, max_w: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<u8> = (0..max_h)
        .flat_map(|i| (0..max_w).map(move |j| u8::from(i >= h || j >= w)))
        .collect();
    Ok(Tensor::from_vec(mask, (max_h, max_w), device)?)
}
