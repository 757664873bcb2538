use crate::refexp::Sample;
use crate::Result;
use candle::{Device, Tensor};
use refcap_transformers::models::caption::CaptionInputs;
use refcap_transformers::NestedTensor;

/// A collated group of samples, images padded to the largest one of the batch.
#[derive(Debug, Clone)]
pub struct Batch {
    pub ann_ids: Vec<u64>,
    pub target: NestedTensor,
    pub global: NestedTensor,
    /// `(batch, 7)`
    pub location: Tensor,
    /// `(batch, max_length)` u32
    pub captions: Tensor,
    /// `(batch, max_length)` u8, `1` on padding.
    pub caption_masks: Tensor,
    pub references: Vec<Vec<String>>,
}

impl Batch {
    pub fn collate(samples: Vec<Sample>) -> Result<Self> {
        let mut ann_ids = Vec::with_capacity(samples.len());
        let mut targets = Vec::with_capacity(samples.len());
        let mut globals = Vec::with_capacity(samples.len());
        let mut locations = Vec::with_capacity(samples.len());
        let mut captions = Vec::with_capacity(samples.len());
        let mut caption_masks = Vec::with_capacity(samples.len());
        let mut references = Vec::with_capacity(samples.len());
        for sample in samples {
            ann_ids.push(sample.ann_id);
            targets.push(sample.target);
            globals.push(sample.global);
            locations.push(sample.location);
            captions.push(sample.caption);
            caption_masks.push(sample.caption_mask);
            references.push(sample.references);
        }
        Ok(Self {
            ann_ids,
            target: NestedTensor::from_tensor_list(&targets)?,
            global: NestedTensor::from_tensor_list(&globals)?,
            location: Tensor::stack(&locations, 0)?,
            captions: Tensor::stack(&captions, 0)?,
            caption_masks: Tensor::stack(&caption_masks, 0)?,
            references,
        })
    }

    pub fn len(&self) -> usize {
        self.ann_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ann_ids.is_empty()
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            ann_ids: self.ann_ids.clone(),
            target: self.target.to_device(device)?,
            global: self.global.to_device(device)?,
            location: self.location.to_device(device)?,
            captions: self.captions.to_device(device)?,
            caption_masks: self.caption_masks.to_device(device)?,
            references: self.references.clone(),
        })
    }

    /// Every image input of the batch; the model ignores the ones its variant does not use.
    pub fn inputs(&self) -> CaptionInputs<'_> {
        CaptionInputs::new(&self.target)
            .with_global(&self.global)
            .with_location(&self.location)
    }
}

/// Groups consecutive samples into batches.
///
/// A sample that fails to load is returned as an error as soon as it is read; the samples
/// already gathered for that batch are dropped.
pub struct Batcher<I> {
    inner: I,
    batch_size: usize,
    return_last_incomplete_batch: bool,
}

impl<I: Iterator<Item = Result<Sample>>> Batcher<I> {
    pub fn new(inner: I) -> Self {
        Self {
            inner,
            batch_size: 16,
            return_last_incomplete_batch: false,
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn return_last_incomplete_batch(mut self, r: bool) -> Self {
        self.return_last_incomplete_batch = r;
        self
    }
}

impl<I: Iterator<Item = Result<Sample>>> Iterator for Batcher<I> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut samples = Vec::with_capacity(self.batch_size);
        for _i in 0..self.batch_size {
            match self.inner.next() {
                Some(Ok(sample)) => samples.push(sample),
                Some(Err(err)) => return Some(Err(err)),
                None => {
                    if self.return_last_incomplete_batch && !samples.is_empty() {
                        break;
                    }
                    return None;
                }
            }
        }
        if samples.is_empty() {
            return None;
        }
        Some(Batch::collate(samples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    fn sample(ann_id: u64) -> candle::Result<Sample> {
        let dev = Device::Cpu;
        Ok(Sample {
            ann_id,
            target: Tensor::zeros((3, 4, 4), candle::DType::F32, &dev)?,
            global: Tensor::zeros((3, 8, 6), candle::DType::F32, &dev)?,
            location: Tensor::zeros(7, candle::DType::F32, &dev)?,
            caption: Tensor::zeros(5, candle::DType::U32, &dev)?,
            caption_mask: Tensor::zeros(5, candle::DType::U8, &dev)?,
            references: vec![format!("region {ann_id}")],
        })
    }

    #[test]
    fn failing_sample_is_returned_first() -> Result<()> {
        let items = vec![
            Ok(sample(0)?),
            Err(Error::IndexOutOfRange { idx: 9, len: 4 }),
            Ok(sample(2)?),
            Ok(sample(3)?),
            Ok(sample(4)?),
        ];
        let mut batcher = Batcher::new(items.into_iter()).batch_size(2);
        assert!(matches!(
            batcher.next(),
            Some(Err(Error::IndexOutOfRange { idx: 9, .. }))
        ));
        let batch = batcher.next().expect("a batch")?;
        assert_eq!(batch.ann_ids, [2, 3]);
        assert_eq!(batch.location.dims(), &[2, 7]);
        // The last sample does not fill a batch.
        assert!(batcher.next().is_none());
        Ok(())
    }
}
