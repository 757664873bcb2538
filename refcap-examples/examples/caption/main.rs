#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use candle::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use refcap_datasets::refexp::{
    load_annotations, location_features, RefExpDataset, SampleMode, Split,
};
use refcap_datasets::tokenizer::CaptionTokenizer;
use refcap_datasets::transforms::{crop, load_image, ImageTransform};
use refcap_datasets::Batcher;
use refcap_examples::checkpoint;
use refcap_examples::config::TrainingConfig;
use refcap_examples::engine::eval_model;
use refcap_transformers::generation::GreedyDecoder;
use refcap_transformers::models::caption::{build_model, CaptionInputs};
use refcap_transformers::NestedTensor;

#[derive(Clone, Debug, Copy, ValueEnum)]
enum Mode {
    /// Score the validation split with CIDEr-D.
    Val,
    /// Describe one region of one image.
    Image,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    #[arg(long, value_enum, default_value_t = Mode::Val)]
    mode: Mode,

    /// Safetensors checkpoint written by the train example.
    #[arg(long, default_value = "checkpoint.safetensors")]
    checkpoint: PathBuf,

    /// JSON training configuration, used for the data paths and for the model when the
    /// checkpoint does not embed its own configuration.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Tokenization config, fetched from the hub when not set.
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// The image to describe in image mode.
    #[arg(long)]
    path: Option<PathBuf>,

    /// Region to describe as `x,y,w,h` in pixels, the whole image when not set.
    #[arg(long, num_args = 4, value_delimiter = ',')]
    bbox: Option<Vec<f32>>,

    /// Write the validation predictions to this JSON file.
    #[arg(long)]
    output: Option<PathBuf>,
}

pub fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = refcap_examples::init_tracing(args.tracing);
    let device = refcap_examples::device(args.cpu)?;

    let mut cfg = match &args.config {
        Some(path) => TrainingConfig::from_file(path)?,
        None => TrainingConfig::default(),
    };
    if !args.checkpoint.exists() {
        anyhow::bail!("no checkpoint found at {:?}", args.checkpoint)
    }
    let metadata = checkpoint::read_metadata(&args.checkpoint)?;
    if let Some(model) = metadata.model {
        cfg.model = model
    }
    cfg.validate()?;
    tracing::info!(epoch = metadata.epoch, cider = ?metadata.cider, "found checkpoint");

    let tokenizer_file = match args.tokenizer.as_ref().or(cfg.tokenizer.as_ref()) {
        Some(path) => path.clone(),
        None => refcap_examples::hub_tokenizer(refcap_examples::DEFAULT_TOKENIZER_REPO)?,
    };
    let tokenizer = CaptionTokenizer::from_file(tokenizer_file, cfg.max_caption_length)?;

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let (model, _) = build_model(&cfg.model, vb)?;
    checkpoint::load_strict(&varmap, &args.checkpoint)?;
    let transform = ImageTransform::new(cfg.max_image_size);

    match args.mode {
        Mode::Val => {
            let annotations = load_annotations(&cfg.annotations)?;
            let dataset = RefExpDataset::new(
                &cfg.image_root,
                annotations,
                Split::Val,
                SampleMode::Unique,
                transform,
                tokenizer.clone(),
            );
            let batches = Batcher::new(dataset.samples(0..dataset.len()))
                .batch_size(cfg.batch_size)
                .return_last_incomplete_batch(true);
            let (score, predictions) = eval_model(&model, batches, &tokenizer, &device)?;
            println!("CIDEr: {:.5} over {} regions", score.corpus, predictions.len());
            if let Some(output) = &args.output {
                let file = std::fs::File::create(output)?;
                serde_json::to_writer_pretty(file, &predictions)?;
                println!("predictions written to {output:?}");
            }
        }
        Mode::Image => {
            let path = match &args.path {
                Some(path) => path,
                None => anyhow::bail!("image mode requires --path"),
            };
            let image = load_image(path)?;
            let bbox = match args.bbox.as_deref() {
                Some(&[x, y, w, h]) => [x, y, w, h],
                Some(bbox) => anyhow::bail!("expected x,y,w,h, got {bbox:?}"),
                None => [0., 0., image.width() as f32, image.height() as f32],
            };
            let region = match crop(&image, bbox) {
                Some(region) => region,
                None => anyhow::bail!("the box {bbox:?} lies outside of the image"),
            };
            let target = NestedTensor::from_tensor_list(&[transform.apply(&region)?])?
                .to_device(&device)?;
            let global =
                NestedTensor::from_tensor_list(&[transform.apply(&image)?])?.to_device(&device)?;
            let location = location_features(bbox, image.width(), image.height());
            let location = Tensor::new(&[location], &Device::Cpu)?.to_device(&device)?;
            let inputs = CaptionInputs::new(&target)
                .with_global(&global)
                .with_location(&location);
            let decoder = GreedyDecoder::new(
                tokenizer.start_token(),
                tokenizer.end_token(),
                tokenizer.max_length(),
            );
            let sequences = decoder.decode(&model, &inputs)?;
            for ids in sequences.iter() {
                println!("{}", tokenizer.decode(ids)?);
            }
        }
    }
    Ok(())
}
