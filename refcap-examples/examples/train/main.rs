#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use std::path::PathBuf;

use clap::Parser;
use rand::SeedableRng;

use candle::DType;
use candle_nn::{VarBuilder, VarMap};
use refcap_datasets::refexp::{load_annotations, RefExpDataset, SampleMode, Split};
use refcap_datasets::tokenizer::CaptionTokenizer;
use refcap_datasets::transforms::ImageTransform;
use refcap_datasets::Batcher;
use refcap_examples::checkpoint::{self, CheckpointMetadata};
use refcap_examples::config::TrainingConfig;
use refcap_examples::engine::{eval_model, evaluate, train_one_epoch};
use refcap_examples::optim::CaptionOptimizer;
use refcap_transformers::models::caption::build_model;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    /// JSON training configuration, the flags below take precedence over it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON lines file with the referring expressions.
    #[arg(long)]
    annotations: Option<PathBuf>,

    /// Directory the image paths of the annotations are relative to.
    #[arg(long)]
    image_root: Option<PathBuf>,

    /// Tokenization config, fetched from the hub when not set.
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// Directory where a checkpoint is written after every epoch.
    #[arg(long)]
    checkpoint_path: Option<PathBuf>,

    /// Warm start from a checkpoint, possibly of another model variant.
    #[arg(long)]
    resume: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    lr: Option<f64>,

    /// Learning rate of the backbone, 0 keeps it frozen.
    #[arg(long)]
    lr_backbone: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,

    /// Append the box geometry to the target features (`true` or `false`).
    #[arg(long)]
    use_location_features: Option<bool>,

    /// Encode the whole image as a context stream, requires the location features.
    #[arg(long)]
    use_global_features: Option<bool>,
}

impl Args {
    fn training_config(&self) -> anyhow::Result<TrainingConfig> {
        let mut cfg = match &self.config {
            Some(path) => TrainingConfig::from_file(path)?,
            None => TrainingConfig::default(),
        };
        if let Some(v) = &self.annotations {
            cfg.annotations = v.clone()
        }
        if let Some(v) = &self.image_root {
            cfg.image_root = v.clone()
        }
        if let Some(v) = &self.tokenizer {
            cfg.tokenizer = Some(v.clone())
        }
        if let Some(v) = &self.checkpoint_path {
            cfg.checkpoint_path = v.clone()
        }
        if let Some(v) = self.epochs {
            cfg.epochs = v
        }
        if let Some(v) = self.batch_size {
            cfg.batch_size = v
        }
        if let Some(v) = self.lr {
            cfg.lr = v
        }
        if let Some(v) = self.lr_backbone {
            cfg.lr_backbone = v
        }
        if let Some(v) = self.seed {
            cfg.seed = v
        }
        if let Some(v) = self.use_location_features {
            cfg.model.use_location_features = v
        }
        if let Some(v) = self.use_global_features {
            cfg.model.use_global_features = v
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

pub fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = refcap_examples::init_tracing(args.tracing);
    let cfg = args.training_config()?;
    let device = refcap_examples::device(args.cpu)?;
    tracing::info!(?device, "initializing");

    let tokenizer_file = match &cfg.tokenizer {
        Some(path) => path.clone(),
        None => refcap_examples::hub_tokenizer(refcap_examples::DEFAULT_TOKENIZER_REPO)?,
    };
    let tokenizer = CaptionTokenizer::from_file(tokenizer_file, cfg.max_caption_length)?;
    if tokenizer.vocab_size() > cfg.model.vocab_size {
        anyhow::bail!(
            "the tokenizer has {} tokens but the model only {}",
            tokenizer.vocab_size(),
            cfg.model.vocab_size
        )
    }

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let (model, criterion) = build_model(&cfg.model, vb)?;
    if let Some(resume) = &args.resume {
        let report = checkpoint::load_partial(&varmap, resume)?;
        if !report.missing.is_empty() {
            tracing::warn!(missing = ?report.missing, "parameters left at their initial value");
        }
    }
    let mut optimizer = CaptionOptimizer::new(&varmap, &cfg)?;
    let n_parameters: usize = optimizer
        .trainable_vars()
        .iter()
        .map(|v| v.elem_count())
        .sum();
    tracing::info!(n_parameters, "number of trainable parameters");

    let annotations = load_annotations(&cfg.annotations)?;
    let transform = ImageTransform::new(cfg.max_image_size);
    let dataset = |split, mode| {
        RefExpDataset::new(
            &cfg.image_root,
            annotations.clone(),
            split,
            mode,
            transform,
            tokenizer.clone(),
        )
    };
    let train = dataset(Split::Train, SampleMode::PerSentence);
    let val = dataset(Split::Val, SampleMode::PerSentence);
    let cider = dataset(Split::Val, SampleMode::Unique);
    tracing::info!(
        train = train.len(),
        val = val.len(),
        cider = cider.len(),
        "datasets ready"
    );

    std::fs::create_dir_all(&cfg.checkpoint_path)?;
    let mut rng = rand::rngs::StdRng::seed_from_u64(cfg.seed);
    for epoch in cfg.start_epoch..cfg.epochs {
        tracing::info!(epoch, "starting epoch");
        let batches =
            Batcher::new(train.samples(train.shuffled_indices(&mut rng))).batch_size(cfg.batch_size);
        let train_loss =
            train_one_epoch(&model, &criterion, batches, &mut optimizer, &device, epoch)?;
        println!("epoch {epoch:4} training loss: {train_loss:8.5}");

        let batches = Batcher::new(val.samples(0..val.len()))
            .batch_size(cfg.batch_size)
            .return_last_incomplete_batch(true);
        let val_loss = evaluate(&model, &criterion, batches, &device)?;
        println!("epoch {epoch:4} validation loss: {val_loss:8.5}");

        let batches = Batcher::new(cider.samples(0..cider.len()))
            .batch_size(cfg.batch_size)
            .return_last_incomplete_batch(true);
        let (score, _) = eval_model(&model, batches, &tokenizer, &device)?;
        println!("epoch {epoch:4} CIDEr: {:8.5}", score.corpus);

        let metadata = CheckpointMetadata {
            epoch,
            train_loss: Some(train_loss),
            val_loss: Some(val_loss),
            cider: Some(score.corpus),
            model: Some(cfg.model.clone()),
        };
        checkpoint::save(&varmap, &metadata, cfg.checkpoint_file(epoch))?;
    }
    Ok(())
}
