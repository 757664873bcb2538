use std::io::Write;
use std::str::FromStr;

use image::{Rgb, RgbImage};
use rand::SeedableRng;
use refcap_datasets::refexp::{load_annotations, RefExpDataset, SampleMode, Split};
use refcap_datasets::tokenizer::CaptionTokenizer;
use refcap_datasets::transforms::ImageTransform;
use refcap_datasets::{Batcher, Error, Result};
use tokenizers::Tokenizer;

const VOCAB: [&str; 12] = [
    "[PAD]", "[UNK]", "[CLS]", "[SEP]", "man", "on", "the", "left", "red", "car", "a", "right",
];

fn tokenizer(max_length: usize) -> Result<CaptionTokenizer> {
    let vocab = VOCAB
        .iter()
        .enumerate()
        .map(|(i, w)| format!("\"{w}\": {i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let json = format!(
        r#"{{
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": {{"type": "Lowercase"}},
            "pre_tokenizer": {{"type": "Whitespace"}},
            "post_processor": null,
            "decoder": null,
            "model": {{"type": "WordLevel", "vocab": {{{vocab}}}, "unk_token": "[UNK]"}}
        }}"#
    );
    let tokenizer = Tokenizer::from_str(&json).map_err(|e| Error::Tokenizer(e.to_string()))?;
    CaptionTokenizer::new(tokenizer, max_length)
}

const ANNOTATIONS: &str = r#"
{"ann_id": 1, "image": "a.png", "bbox": [0, 0, 20, 10], "sentences": ["man on the left", "left man"], "split": "train"}
{"ann_id": 2, "image": "b.png", "bbox": [5, 5, 30, 30], "sentences": ["red car"], "split": "train"}

{"ann_id": 3, "image": "a.png", "bbox": [20, 0, 20, 30], "sentences": ["a man on the right"], "split": "val"}
{"ann_id": 4, "image": "b.png", "bbox": [0, 0, 8, 8], "sentences": [], "split": "train"}
"#;

struct Fixture {
    dir: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        RgbImage::from_pixel(40, 30, Rgb([200, 10, 10]))
            .save(dir.path().join("a.png"))
            .unwrap();
        RgbImage::from_pixel(64, 48, Rgb([10, 200, 10]))
            .save(dir.path().join("b.png"))
            .unwrap();
        let mut file = std::fs::File::create(dir.path().join("refs.jsonl")).unwrap();
        file.write_all(ANNOTATIONS.as_bytes()).unwrap();
        Self { dir }
    }

    fn dataset(&self, split: Split, mode: SampleMode) -> Result<RefExpDataset> {
        let annotations = load_annotations(self.dir.path().join("refs.jsonl"))?;
        Ok(RefExpDataset::new(
            self.dir.path(),
            annotations,
            split,
            mode,
            ImageTransform::new(32),
            tokenizer(8)?,
        ))
    }
}

#[test]
fn tokenizer_pads_and_truncates() -> Result<()> {
    let captions = tokenizer(6)?;
    let (ids, mask) = captions.encode("Man on the LEFT")?;
    assert_eq!(ids, [2, 4, 5, 6, 7, 3]);
    assert_eq!(mask, [0, 0, 0, 0, 0, 0]);
    let (ids, mask) = captions.encode("red car")?;
    assert_eq!(ids, [2, 8, 9, 3, 0, 0]);
    assert_eq!(mask, [0, 0, 0, 0, 1, 1]);
    let (ids, _) = captions.encode("a man on the right side")?;
    assert_eq!(ids, [2, 10, 4, 5, 6, 3]);
    assert_eq!(captions.decode(&[8, 9])?, "red car");
    assert!(matches!(tokenizer(1), Err(Error::Tokenizer(_))));
    Ok(())
}

#[test]
fn annotations_skip_blank_lines() -> Result<()> {
    let fixture = Fixture::new();
    let annotations = load_annotations(fixture.dir.path().join("refs.jsonl"))?;
    assert_eq!(annotations.len(), 4);
    assert_eq!(annotations[2].split, Split::Val);
    assert_eq!(annotations[1].bbox, [5., 5., 30., 30.]);

    let path = fixture.dir.path().join("broken.jsonl");
    std::fs::write(&path, "{\"ann_id\": 1}\n").unwrap();
    let err = load_annotations(&path).unwrap_err();
    assert!(matches!(err, Error::Annotation { line: 1, .. }));
    Ok(())
}

#[test]
fn sample_modes() -> Result<()> {
    let fixture = Fixture::new();
    let per_sentence = fixture.dataset(Split::Train, SampleMode::PerSentence)?;
    assert_eq!(per_sentence.len(), 3);
    let unique = fixture.dataset(Split::Train, SampleMode::Unique)?;
    assert_eq!(unique.len(), 2);
    let val = fixture.dataset(Split::Val, SampleMode::PerSentence)?;
    assert_eq!(val.len(), 1);

    let sample = per_sentence.get(1)?;
    assert_eq!(sample.ann_id, 1);
    assert_eq!(sample.references, ["man on the left", "left man"]);
    assert_eq!(sample.caption.to_vec1::<u32>()?, [2, 7, 4, 3, 0, 0, 0, 0]);
    assert_eq!(sample.caption_mask.to_vec1::<u8>()?, [0, 0, 0, 0, 1, 1, 1, 1]);
    // 20x10 crop, already small enough.
    assert_eq!(sample.target.dims(), &[3, 10, 20]);
    // 40x30 image shrunk to a longer side of 32.
    assert_eq!(sample.global.dims(), &[3, 24, 32]);
    let location = sample.location.to_vec1::<f32>()?;
    assert_eq!(location.len(), 7);
    assert!((location[2] - 0.5).abs() < 1e-6);

    assert!(matches!(
        per_sentence.get(3),
        Err(Error::IndexOutOfRange { idx: 3, len: 3 })
    ));
    Ok(())
}

#[test]
fn batches_pad_images_and_stack_captions() -> Result<()> {
    let fixture = Fixture::new();
    let dataset = fixture.dataset(Split::Train, SampleMode::PerSentence)?;
    let mut rng = rand::rngs::StdRng::seed_from_u64(299792458);
    let order = dataset.shuffled_indices(&mut rng);
    let mut sorted = order.clone();
    sorted.sort();
    assert_eq!(sorted, [0, 1, 2]);

    let batches = Batcher::new(dataset.samples(order))
        .batch_size(2)
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(batches.len(), 1);
    let batch = &batches[0];
    assert_eq!(batch.len(), 2);
    assert_eq!(batch.captions.dims(), &[2, 8]);
    assert_eq!(batch.caption_masks.dims(), &[2, 8]);
    assert_eq!(batch.location.dims(), &[2, 7]);
    let (b, c, _, _) = batch.target.tensors().dims4()?;
    assert_eq!((b, c), (2, 3));

    let batches = Batcher::new(dataset.samples(0..dataset.len()))
        .batch_size(2)
        .return_last_incomplete_batch(true)
        .collect::<Result<Vec<_>>>()?;
    assert_eq!(batches.iter().map(|b| b.len()).collect::<Vec<_>>(), [2, 1]);
    assert_eq!(batches[1].ann_ids, [2]);
    Ok(())
}

#[test]
fn missing_image_is_reported() -> Result<()> {
    let fixture = Fixture::new();
    let dataset = fixture.dataset(Split::Train, SampleMode::Unique)?;
    std::fs::remove_file(fixture.dir.path().join("b.png")).unwrap();
    let err = Batcher::new(dataset.samples(0..2))
        .batch_size(2)
        .next()
        .expect("a batch")
        .unwrap_err();
    assert!(matches!(err, Error::Io { .. }));
    Ok(())
}
