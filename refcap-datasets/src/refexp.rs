//! Referring-expression annotations and the samples built from them.
//!
//! Annotations are stored as JSON lines, one object per region:
//!
//! ```json
//! {"ann_id": 7, "image": "coco/0001.jpg", "bbox": [12.0, 30.5, 80.0, 64.0],
//!  "sentences": ["man on the left", "left guy"], "split": "train"}
//! ```
//!
//! `image` is relative to the image root and `bbox` is `[x, y, w, h]` in pixels.
use crate::tokenizer::CaptionTokenizer;
use crate::transforms::{crop, load_image, ImageTransform};
use crate::{Error, Result};
use candle::{Device, Tensor};
use rand::seq::SliceRandom;
use std::io::BufRead;
use std::path::{Path, PathBuf};

pub const LOCATION_DIM: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    #[serde(alias = "training")]
    Train,
    #[serde(alias = "validation")]
    Val,
    Test,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Annotation {
    pub ann_id: u64,
    pub image: PathBuf,
    pub bbox: [f32; 4],
    pub sentences: Vec<String>,
    pub split: Split,
}

pub fn load_annotations<P: AsRef<Path>>(p: P) -> Result<Vec<Annotation>> {
    let path = p.as_ref();
    let io_err = |source| Error::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = std::fs::File::open(path).map_err(io_err)?;
    let mut annotations = vec![];
    for (index, line) in std::io::BufReader::new(file).lines().enumerate() {
        let line = line.map_err(io_err)?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let annotation = serde_json::from_str(line).map_err(|source| Error::Annotation {
            path: path.to_path_buf(),
            line: index + 1,
            source,
        })?;
        annotations.push(annotation)
    }
    Ok(annotations)
}

/// `[x1/W, y1/H, x2/W, y2/H, wh/(WH), w/W, h/H]` for a `[x, y, w, h]` box in a `W x H` image.
pub fn location_features(bbox: [f32; 4], width: u32, height: u32) -> [f32; LOCATION_DIM] {
    let [x, y, w, h] = bbox;
    let (iw, ih) = (width as f32, height as f32);
    [
        x / iw,
        y / ih,
        (x + w) / iw,
        (y + h) / ih,
        (w * h) / (iw * ih),
        w / iw,
        h / ih,
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleMode {
    /// One sample per (region, sentence) pair.
    PerSentence,
    /// One sample per region, carrying every sentence as a reference.
    Unique,
}

#[derive(Debug, Clone)]
pub struct Sample {
    pub ann_id: u64,
    /// `(3, h, w)` crop of the referred region.
    pub target: Tensor,
    /// `(3, h, w)` whole image.
    pub global: Tensor,
    /// `(7,)`
    pub location: Tensor,
    /// `(max_length,)` u32 token ids.
    pub caption: Tensor,
    /// `(max_length,)` u8, `1` on padding.
    pub caption_mask: Tensor,
    pub references: Vec<String>,
}

pub struct RefExpDataset {
    image_root: PathBuf,
    annotations: Vec<Annotation>,
    index: Vec<(usize, usize)>,
    transform: ImageTransform,
    tokenizer: CaptionTokenizer,
}

impl RefExpDataset {
    pub fn new<P: AsRef<Path>>(
        image_root: P,
        annotations: Vec<Annotation>,
        split: Split,
        mode: SampleMode,
        transform: ImageTransform,
        tokenizer: CaptionTokenizer,
    ) -> Self {
        let annotations: Vec<Annotation> = annotations
            .into_iter()
            .filter(|a| a.split == split && !a.sentences.is_empty())
            .collect();
        let index = annotations
            .iter()
            .enumerate()
            .flat_map(|(i, a)| {
                let sentences = match mode {
                    SampleMode::PerSentence => a.sentences.len(),
                    SampleMode::Unique => 1,
                };
                (0..sentences).map(move |s| (i, s))
            })
            .collect::<Vec<_>>();
        tracing::info!(
            ?split,
            ?mode,
            regions = annotations.len(),
            samples = index.len(),
            "loaded referring expressions"
        );
        Self {
            image_root: image_root.as_ref().to_path_buf(),
            annotations,
            index,
            transform,
            tokenizer,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn tokenizer(&self) -> &CaptionTokenizer {
        &self.tokenizer
    }

    pub fn get(&self, idx: usize) -> Result<Sample> {
        let &(a, s) = self.index.get(idx).ok_or(Error::IndexOutOfRange {
            idx,
            len: self.len(),
        })?;
        let annotation = &self.annotations[a];
        let sentence = annotation
            .sentences
            .get(s)
            .ok_or(Error::NoSentences {
                ann_id: annotation.ann_id,
            })?;

        let image = load_image(self.image_root.join(&annotation.image))?;
        let region = crop(&image, annotation.bbox).ok_or(Error::EmptyBox {
            ann_id: annotation.ann_id,
            bbox: annotation.bbox,
        })?;
        let target = self.transform.apply(&region)?;
        let global = self.transform.apply(&image)?;
        let location = location_features(annotation.bbox, image.width(), image.height());
        let location = Tensor::new(&location, &Device::Cpu)?;

        let (ids, mask) = self.tokenizer.encode(sentence)?;
        let len = ids.len();
        let caption = Tensor::from_vec(ids, len, &Device::Cpu)?;
        let caption_mask = Tensor::from_vec(mask, len, &Device::Cpu)?;
        Ok(Sample {
            ann_id: annotation.ann_id,
            target,
            global,
            location,
            caption,
            caption_mask,
            references: annotation.sentences.clone(),
        })
    }

    /// Lazily loads the samples at `indices`, in order.
    pub fn samples<'a, I>(&'a self, indices: I) -> impl Iterator<Item = Result<Sample>> + 'a
    where
        I: IntoIterator<Item = usize>,
        I::IntoIter: 'a,
    {
        indices.into_iter().map(move |idx| self.get(idx))
    }

    pub fn shuffled_indices<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.len()).collect();
        indices.shuffle(rng);
        indices
    }
}
