//! Training, validation and caption evaluation loops.
use crate::optim::CaptionOptimizer;
use candle::{Device, Tensor};
use refcap_datasets::tokenizer::CaptionTokenizer;
use refcap_datasets::Batch;
use refcap_transformers::cider::{Cider, CiderScore};
use refcap_transformers::generation::GreedyDecoder;
use refcap_transformers::models::caption::{CaptionModel, CrossEntropyLoss};

/// Teacher forcing split of `(batch, t)` captions: the decoder reads `[:, :-1]` and predicts
/// `[:, 1:]`.
pub fn shift_tokens(captions: &Tensor, masks: &Tensor) -> candle::Result<(Tensor, Tensor, Tensor)> {
    let (_b_sz, t) = captions.dims2()?;
    if t < 2 {
        candle::bail!("captions need at least two tokens, got {t}")
    }
    let inputs = captions.narrow(1, 0, t - 1)?;
    let input_masks = masks.narrow(1, 0, t - 1)?;
    let targets = captions.narrow(1, 1, t - 1)?;
    Ok((inputs, input_masks, targets))
}

fn batch_loss(
    model: &CaptionModel,
    criterion: &CrossEntropyLoss,
    batch: &Batch,
    train: bool,
) -> anyhow::Result<Tensor> {
    let (inputs, input_masks, targets) = shift_tokens(&batch.captions, &batch.caption_masks)?;
    let logits = model.forward_t(&batch.inputs(), &inputs, &input_masks, train)?;
    Ok(criterion.forward(&logits, &targets)?)
}

/// Runs one epoch of teacher forced training and returns the mean batch loss. A non finite loss
/// aborts the run.
pub fn train_one_epoch<I>(
    model: &CaptionModel,
    criterion: &CrossEntropyLoss,
    batches: I,
    optimizer: &mut CaptionOptimizer,
    device: &Device,
    epoch: usize,
) -> anyhow::Result<f64>
where
    I: Iterator<Item = refcap_datasets::Result<Batch>>,
{
    let mut total = 0f64;
    let mut count = 0usize;
    for (step, batch) in batches.enumerate() {
        let batch = batch?.to_device(device)?;
        let loss = batch_loss(model, criterion, &batch, true)?;
        let loss_value = loss.to_scalar::<f32>()? as f64;
        if !loss_value.is_finite() {
            anyhow::bail!("loss is {loss_value} at epoch {epoch} step {step}, stopping training")
        }
        let grad_norm = optimizer.backward_step(&loss)?;
        total += loss_value;
        count += 1;
        if step % 100 == 0 {
            tracing::info!(epoch, step, loss = loss_value, grad_norm, "training");
        }
    }
    Ok(if count == 0 { 0. } else { total / count as f64 })
}

/// Mean loss over the batches, without dropout or parameter updates.
pub fn evaluate<I>(
    model: &CaptionModel,
    criterion: &CrossEntropyLoss,
    batches: I,
    device: &Device,
) -> anyhow::Result<f64>
where
    I: Iterator<Item = refcap_datasets::Result<Batch>>,
{
    let mut total = 0f64;
    let mut count = 0usize;
    for batch in batches {
        let batch = batch?.to_device(device)?;
        let loss = batch_loss(model, criterion, &batch, false)?;
        total += loss.to_scalar::<f32>()? as f64;
        count += 1;
    }
    Ok(if count == 0 { 0. } else { total / count as f64 })
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Prediction {
    pub ann_id: u64,
    pub caption: String,
    pub references: Vec<String>,
}

/// Greedily captions every batch and scores the captions against their references with
/// CIDEr-D.
pub fn eval_model<I>(
    model: &CaptionModel,
    batches: I,
    tokenizer: &CaptionTokenizer,
    device: &Device,
) -> anyhow::Result<(CiderScore, Vec<Prediction>)>
where
    I: Iterator<Item = refcap_datasets::Result<Batch>>,
{
    let decoder = GreedyDecoder::new(
        tokenizer.start_token(),
        tokenizer.end_token(),
        tokenizer.max_length(),
    );
    let mut predictions = vec![];
    for batch in batches {
        let batch = batch?.to_device(device)?;
        let sequences = decoder.decode(model, &batch.inputs())?;
        for ((ann_id, ids), references) in batch
            .ann_ids
            .iter()
            .zip(sequences.iter())
            .zip(batch.references.iter())
        {
            predictions.push(Prediction {
                ann_id: *ann_id,
                caption: tokenizer.decode(ids)?,
                references: references.clone(),
            })
        }
    }
    let candidates: Vec<&str> = predictions.iter().map(|p| p.caption.as_str()).collect();
    let references: Vec<Vec<&str>> = predictions
        .iter()
        .map(|p| p.references.iter().map(|r| r.as_str()).collect())
        .collect();
    let score = Cider::default().compute(&candidates, &references);
    tracing::info!(samples = predictions.len(), cider = score.corpus, "evaluated captions");
    Ok((score, predictions))
}
