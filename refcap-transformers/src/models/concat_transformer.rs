//! Encoder-decoder transformer over one or two source streams.
//!
//! The target stream and the optional context stream are encoded by separate encoders. Their
//! outputs are concatenated, target positions first, into a single memory that the decoder
//! cross-attends to. All masks are `u8` tensors where `1` marks a position that cannot be
//! attended to.
use super::with_tracing::{layer_norm, linear, LayerNorm, Linear};
use crate::{Error, FeatureStream, Result};
use candle::{DType, Device, Module, Tensor, D};
use candle_nn::{embedding, Dropout, Embedding, VarBuilder};

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct Config {
    pub d_model: usize,
    pub nheads: usize,
    pub enc_layers: usize,
    pub dec_layers: usize,
    pub dim_feedforward: usize,
    pub dropout: f32,
    pub pre_norm: bool,
    pub vocab_size: usize,
    pub max_position_embeddings: usize,
    pub pad_token_id: usize,
    pub layer_norm_eps: f64,
    /// Whether a second encoder is built for a context stream.
    pub context_stream: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            d_model: 256,
            nheads: 8,
            enc_layers: 6,
            dec_layers: 6,
            dim_feedforward: 2048,
            dropout: 0.1,
            pre_norm: true,
            vocab_size: 30522,
            max_position_embeddings: 128,
            pad_token_id: 0,
            layer_norm_eps: 1e-12,
            context_stream: false,
        }
    }
}

fn masked_fill(on_false: &Tensor, mask: &Tensor, on_true: f32) -> candle::Result<Tensor> {
    let shape = on_false.shape();
    let mask = mask.broadcast_as(shape.dims())?;
    let on_true = Tensor::new(on_true, on_false.device())?.broadcast_as(shape.dims())?;
    mask.where_cond(&on_true, on_false)
}

/// `(t, t)` mask that hides future positions.
pub fn causal_mask(t: usize, device: &Device) -> candle::Result<Tensor> {
    let mask: Vec<u8> = (0..t)
        .flat_map(|i| (0..t).map(move |j| u8::from(j > i)))
        .collect();
    Tensor::from_vec(mask, (t, t), device)
}

/// Combines a `(b, s)` key padding mask and a `(t, s)` attention mask into a `(b, 1, t, s)` mask.
fn combine_masks(
    key_padding_mask: Option<&Tensor>,
    attn_mask: Option<&Tensor>,
    (b_sz, t, s): (usize, usize, usize),
) -> candle::Result<Option<Tensor>> {
    let key_padding_mask = match key_padding_mask {
        None => None,
        Some(m) => Some(m.reshape((b_sz, 1, 1, s))?),
    };
    let attn_mask = match attn_mask {
        None => None,
        Some(m) => Some(m.reshape((1, 1, t, s))?),
    };
    let mask = match (key_padding_mask, attn_mask) {
        (None, None) => None,
        (Some(m), None) | (None, Some(m)) => Some(m.broadcast_as((b_sz, 1, t, s))?),
        (Some(k), Some(a)) => Some(k.broadcast_maximum(&a)?),
    };
    Ok(mask)
}

#[derive(Debug, Clone)]
struct MultiHeadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    scaling: f64,
    dropout: Dropout,
    span: tracing::Span,
}

impl MultiHeadAttention {
    fn new(cfg: &Config, vb: VarBuilder) -> candle::Result<Self> {
        let embed_dim = cfg.d_model;
        if embed_dim % cfg.nheads != 0 {
            candle::bail!("d_model {embed_dim} is not divisible by nheads {}", cfg.nheads)
        }
        let head_dim = embed_dim / cfg.nheads;
        let q_proj = linear(embed_dim, embed_dim, vb.pp("q_proj"))?;
        let k_proj = linear(embed_dim, embed_dim, vb.pp("k_proj"))?;
        let v_proj = linear(embed_dim, embed_dim, vb.pp("v_proj"))?;
        let out_proj = linear(embed_dim, embed_dim, vb.pp("out_proj"))?;
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            num_heads: cfg.nheads,
            head_dim,
            scaling: 1. / (head_dim as f64).sqrt(),
            dropout: Dropout::new(cfg.dropout),
            span: tracing::span!(tracing::Level::TRACE, "attention"),
        })
    }

    fn shape(&self, xs: &Tensor, b_sz: usize) -> candle::Result<Tensor> {
        xs.reshape((b_sz, (), self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Returns the attention output `(b, t, d)` and the attention probabilities averaged over
    /// heads `(b, t, s)`.
    fn forward_t(
        &self,
        query: &Tensor,
        key_value: &Tensor,
        key_padding_mask: Option<&Tensor>,
        attn_mask: Option<&Tensor>,
        train: bool,
    ) -> candle::Result<(Tensor, Tensor)> {
        let _enter = self.span.enter();
        let (b_sz, t, _) = query.dims3()?;
        let (_, s, _) = key_value.dims3()?;
        let q = (self.q_proj.forward(query)? * self.scaling)?;
        let q = self.shape(&q, b_sz)?;
        let k = self.shape(&self.k_proj.forward(key_value)?, b_sz)?;
        let v = self.shape(&self.v_proj.forward(key_value)?, b_sz)?;
        let scores = q.matmul(&k.t()?)?;
        let scores = match combine_masks(key_padding_mask, attn_mask, (b_sz, t, s))? {
            None => scores,
            Some(mask) => masked_fill(&scores, &mask, f32::NEG_INFINITY)?,
        };
        let probs = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let weights = probs.mean(1)?;
        let probs = self.dropout.forward(&probs, train)?;
        let xs = probs
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b_sz, t, self.num_heads * self.head_dim))?
            .apply(&self.out_proj)?;
        Ok((xs, weights))
    }
}

#[derive(Debug, Clone)]
struct FeedForward {
    linear1: Linear,
    linear2: Linear,
    dropout: Dropout,
}

impl FeedForward {
    fn new(cfg: &Config, vb: VarBuilder) -> candle::Result<Self> {
        let linear1 = linear(cfg.d_model, cfg.dim_feedforward, vb.pp("linear1"))?;
        let linear2 = linear(cfg.dim_feedforward, cfg.d_model, vb.pp("linear2"))?;
        Ok(Self {
            linear1,
            linear2,
            dropout: Dropout::new(cfg.dropout),
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> candle::Result<Tensor> {
        let xs = self.linear1.forward(xs)?.relu()?;
        let xs = self.dropout.forward(&xs, train)?;
        self.linear2.forward(&xs)
    }
}

#[derive(Debug, Clone)]
struct EncoderLayer {
    self_attn: MultiHeadAttention,
    ffn: FeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
    dropout: Dropout,
    pre_norm: bool,
}

impl EncoderLayer {
    fn new(cfg: &Config, vb: VarBuilder) -> candle::Result<Self> {
        Ok(Self {
            self_attn: MultiHeadAttention::new(cfg, vb.pp("self_attn"))?,
            ffn: FeedForward::new(cfg, vb.clone())?,
            norm1: layer_norm(cfg.d_model, cfg.layer_norm_eps, vb.pp("norm1"))?,
            norm2: layer_norm(cfg.d_model, cfg.layer_norm_eps, vb.pp("norm2"))?,
            dropout: Dropout::new(cfg.dropout),
            pre_norm: cfg.pre_norm,
        })
    }

    fn forward_t(&self, xs: &Tensor, mask: &Tensor, train: bool) -> candle::Result<Tensor> {
        if self.pre_norm {
            let ys = self.norm1.forward(xs)?;
            let (ys, _) = self.self_attn.forward_t(&ys, &ys, Some(mask), None, train)?;
            let xs = (xs + self.dropout.forward(&ys, train)?)?;
            let ys = self.ffn.forward_t(&self.norm2.forward(&xs)?, train)?;
            xs + self.dropout.forward(&ys, train)?
        } else {
            let (ys, _) = self.self_attn.forward_t(xs, xs, Some(mask), None, train)?;
            let xs = self.norm1.forward(&(xs + self.dropout.forward(&ys, train)?)?)?;
            let ys = self.ffn.forward_t(&xs, train)?;
            self.norm2.forward(&(xs + self.dropout.forward(&ys, train)?)?)
        }
    }
}

#[derive(Debug, Clone)]
struct Encoder {
    layers: Vec<EncoderLayer>,
    norm: Option<LayerNorm>,
    span: tracing::Span,
}

impl Encoder {
    fn new(cfg: &Config, vb: VarBuilder) -> candle::Result<Self> {
        let vb_l = vb.pp("layers");
        let layers = (0..cfg.enc_layers)
            .map(|i| EncoderLayer::new(cfg, vb_l.pp(i)))
            .collect::<candle::Result<Vec<_>>>()?;
        let norm = if cfg.pre_norm {
            Some(layer_norm(cfg.d_model, cfg.layer_norm_eps, vb.pp("norm"))?)
        } else {
            None
        };
        Ok(Self {
            layers,
            norm,
            span: tracing::span!(tracing::Level::TRACE, "encoder"),
        })
    }

    fn forward_t(&self, xs: &Tensor, mask: &Tensor, train: bool) -> candle::Result<Tensor> {
        let _enter = self.span.enter();
        let mut xs = xs.clone();
        for layer in self.layers.iter() {
            xs = layer.forward_t(&xs, mask, train)?
        }
        match &self.norm {
            None => Ok(xs),
            Some(norm) => norm.forward(&xs),
        }
    }
}

#[derive(Debug, Clone)]
struct DecoderLayer {
    self_attn: MultiHeadAttention,
    cross_attn: MultiHeadAttention,
    ffn: FeedForward,
    norm1: LayerNorm,
    norm2: LayerNorm,
    norm3: LayerNorm,
    dropout: Dropout,
    pre_norm: bool,
}

impl DecoderLayer {
    fn new(cfg: &Config, vb: VarBuilder) -> candle::Result<Self> {
        Ok(Self {
            self_attn: MultiHeadAttention::new(cfg, vb.pp("self_attn"))?,
            cross_attn: MultiHeadAttention::new(cfg, vb.pp("cross_attn"))?,
            ffn: FeedForward::new(cfg, vb.clone())?,
            norm1: layer_norm(cfg.d_model, cfg.layer_norm_eps, vb.pp("norm1"))?,
            norm2: layer_norm(cfg.d_model, cfg.layer_norm_eps, vb.pp("norm2"))?,
            norm3: layer_norm(cfg.d_model, cfg.layer_norm_eps, vb.pp("norm3"))?,
            dropout: Dropout::new(cfg.dropout),
            pre_norm: cfg.pre_norm,
        })
    }

    fn forward_t(
        &self,
        xs: &Tensor,
        memory: &Memory,
        tgt_mask: &Tensor,
        causal: &Tensor,
        train: bool,
    ) -> candle::Result<(Tensor, Tensor)> {
        if self.pre_norm {
            let ys = self.norm1.forward(xs)?;
            let (ys, _) = self
                .self_attn
                .forward_t(&ys, &ys, Some(tgt_mask), Some(causal), train)?;
            let xs = (xs + self.dropout.forward(&ys, train)?)?;
            let ys = self.norm2.forward(&xs)?;
            let (ys, weights) =
                self.cross_attn
                    .forward_t(&ys, &memory.states, Some(&memory.mask), None, train)?;
            let xs = (xs + self.dropout.forward(&ys, train)?)?;
            let ys = self.ffn.forward_t(&self.norm3.forward(&xs)?, train)?;
            let xs = (xs + self.dropout.forward(&ys, train)?)?;
            Ok((xs, weights))
        } else {
            let (ys, _) = self
                .self_attn
                .forward_t(xs, xs, Some(tgt_mask), Some(causal), train)?;
            let xs = self.norm1.forward(&(xs + self.dropout.forward(&ys, train)?)?)?;
            let (ys, weights) =
                self.cross_attn
                    .forward_t(&xs, &memory.states, Some(&memory.mask), None, train)?;
            let xs = self.norm2.forward(&(xs + self.dropout.forward(&ys, train)?)?)?;
            let ys = self.ffn.forward_t(&xs, train)?;
            let xs = self.norm3.forward(&(xs + self.dropout.forward(&ys, train)?)?)?;
            Ok((xs, weights))
        }
    }
}

#[derive(Debug, Clone)]
struct DecoderEmbeddings {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    layer_norm: LayerNorm,
    dropout: Dropout,
    max_position_embeddings: usize,
    pad_token_id: u32,
}

impl DecoderEmbeddings {
    fn new(cfg: &Config, vb: VarBuilder) -> candle::Result<Self> {
        let word_embeddings = embedding(cfg.vocab_size, cfg.d_model, vb.pp("word_embeddings"))?;
        let position_embeddings = embedding(
            cfg.max_position_embeddings,
            cfg.d_model,
            vb.pp("position_embeddings"),
        )?;
        let layer_norm = layer_norm(cfg.d_model, cfg.layer_norm_eps, vb.pp("LayerNorm"))?;
        Ok(Self {
            word_embeddings,
            position_embeddings,
            layer_norm,
            dropout: Dropout::new(cfg.dropout),
            max_position_embeddings: cfg.max_position_embeddings,
            pad_token_id: cfg.pad_token_id as u32,
        })
    }

    fn forward_t(&self, input_ids: &Tensor, train: bool) -> Result<Tensor> {
        let (_b_sz, seq_len) = input_ids.dims2()?;
        if seq_len > self.max_position_embeddings {
            return Err(Error::SequenceTooLong {
                len: seq_len,
                max: self.max_position_embeddings,
            });
        }
        let position_ids = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let words = self.word_embeddings.forward(input_ids)?;
        // Padding tokens embed to zero and their row never receives a gradient.
        let keep = input_ids
            .ne(self.pad_token_id)?
            .to_dtype(words.dtype())?
            .unsqueeze(2)?;
        let xs = words
            .broadcast_mul(&keep)?
            .broadcast_add(&self.position_embeddings.forward(&position_ids)?)?;
        let xs = self.layer_norm.forward(&xs)?;
        Ok(self.dropout.forward(&xs, train)?)
    }
}

#[derive(Debug, Clone)]
struct Decoder {
    layers: Vec<DecoderLayer>,
    norm: LayerNorm,
    span: tracing::Span,
}

impl Decoder {
    fn new(cfg: &Config, vb: VarBuilder) -> candle::Result<Self> {
        let vb_l = vb.pp("layers");
        let layers = (0..cfg.dec_layers)
            .map(|i| DecoderLayer::new(cfg, vb_l.pp(i)))
            .collect::<candle::Result<Vec<_>>>()?;
        let norm = layer_norm(cfg.d_model, cfg.layer_norm_eps, vb.pp("norm"))?;
        Ok(Self {
            layers,
            norm,
            span: tracing::span!(tracing::Level::TRACE, "decoder"),
        })
    }

    fn forward_t(
        &self,
        xs: &Tensor,
        memory: &Memory,
        tgt_mask: &Tensor,
        train: bool,
    ) -> candle::Result<(Tensor, Option<Tensor>)> {
        let _enter = self.span.enter();
        let (_b_sz, t, _) = xs.dims3()?;
        let causal = causal_mask(t, xs.device())?;
        let mut xs = xs.clone();
        let mut weights = None;
        for layer in self.layers.iter() {
            let (ys, w) = layer.forward_t(&xs, memory, tgt_mask, &causal, train)?;
            xs = ys;
            weights = Some(w);
        }
        Ok((self.norm.forward(&xs)?, weights))
    }
}

/// Encoded source positions, `(batch, length, d_model)`, with their `(batch, length)` mask.
#[derive(Debug, Clone)]
pub struct Memory {
    pub states: Tensor,
    pub mask: Tensor,
}

impl Memory {
    pub fn len(&self) -> usize {
        self.mask.dims()[1]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct ConcatTransformer {
    embeddings: DecoderEmbeddings,
    target_encoder: Encoder,
    context_encoder: Option<Encoder>,
    decoder: Decoder,
    d_model: usize,
}

impl ConcatTransformer {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let embeddings = DecoderEmbeddings::new(cfg, vb.pp("embeddings"))?;
        let target_encoder = Encoder::new(cfg, vb.pp("encoder_t"))?;
        let context_encoder = if cfg.context_stream {
            Some(Encoder::new(cfg, vb.pp("encoder_c"))?)
        } else {
            None
        };
        let decoder = Decoder::new(cfg, vb.pp("decoder"))?;
        Ok(Self {
            embeddings,
            target_encoder,
            context_encoder,
            decoder,
            d_model: cfg.d_model,
        })
    }

    pub fn d_model(&self) -> usize {
        self.d_model
    }

    pub fn encode(
        &self,
        target: &FeatureStream,
        context: Option<&FeatureStream>,
        train: bool,
    ) -> Result<Memory> {
        let states = self
            .target_encoder
            .forward_t(&target.sequence_first()?, target.mask(), train)?;
        let memory = Memory {
            states,
            mask: target.mask().clone(),
        };
        match context {
            None => Ok(memory),
            Some(context) => {
                let encoder = self
                    .context_encoder
                    .as_ref()
                    .ok_or(Error::MissingContextEncoder)?;
                let context_states =
                    encoder.forward_t(&context.sequence_first()?, context.mask(), train)?;
                Ok(Memory {
                    states: Tensor::cat(&[&memory.states, &context_states], 1)?,
                    mask: Tensor::cat(&[&memory.mask, context.mask()], 1)?,
                })
            }
        }
    }

    /// Decodes `(batch, t)` token ids against the memory. Returns the `(batch, t, d_model)`
    /// hidden states and the last layer cross-attention weights `(batch, t, memory_len)`.
    pub fn decode(
        &self,
        memory: &Memory,
        tgt: &Tensor,
        tgt_mask: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (b_sz, t) = tgt.dims2()?;
        if tgt_mask.dims() != [b_sz, t] {
            return Err(Error::ShapeMismatch {
                op: "decode",
                features: tgt.shape().clone(),
                mask: tgt_mask.shape().clone(),
            });
        }
        let tgt_mask = tgt_mask.to_dtype(DType::U8)?;
        let xs = self.embeddings.forward_t(tgt, train)?;
        Ok(self.decoder.forward_t(&xs, memory, &tgt_mask, train)?)
    }

    pub fn forward_t(
        &self,
        target: &FeatureStream,
        context: Option<&FeatureStream>,
        tgt: &Tensor,
        tgt_mask: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let memory = self.encode(target, context, train)?;
        self.decode(&memory, tgt, tgt_mask, train)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn causal_mask_hides_future() -> candle::Result<()> {
        let mask = causal_mask(3, &Device::Cpu)?.to_vec2::<u8>()?;
        assert_eq!(mask, [[0, 1, 1], [0, 0, 1], [0, 0, 0]]);
        Ok(())
    }

    #[test]
    fn combined_mask_is_union() -> candle::Result<()> {
        let dev = Device::Cpu;
        let kpm = Tensor::new(&[[0u8, 0, 1], [0, 0, 0]], &dev)?;
        let causal = causal_mask(3, &dev)?;
        let mask = combine_masks(Some(&kpm), Some(&causal), (2, 3, 3))?.unwrap();
        assert_eq!(mask.dims(), &[2, 1, 3, 3]);
        let mask = mask.squeeze(1)?.to_vec3::<u8>()?;
        assert_eq!(mask[0], [[0, 1, 1], [0, 0, 1], [0, 0, 1]]);
        assert_eq!(mask[1], [[0, 1, 1], [0, 0, 1], [0, 0, 0]]);
        Ok(())
    }

    #[test]
    fn padding_row_does_not_reach_the_embeddings() -> Result<()> {
        let dev = Device::Cpu;
        let cfg = Config {
            d_model: 8,
            nheads: 2,
            vocab_size: 10,
            max_position_embeddings: 4,
            dropout: 0.,
            ..Default::default()
        };
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, candle::DType::F32, &dev);
        let embeddings = DecoderEmbeddings::new(&cfg, vb)?;
        let ids = Tensor::new(&[[0u32, 4, 0]], &dev)?;
        let before = embeddings.forward_t(&ids, false)?.squeeze(0)?.to_vec2::<f32>()?;

        let weight = varmap.data().lock().unwrap()["word_embeddings.weight"].clone();
        weight.set(&Tensor::randn(0f32, 1., (10, 8), &dev)?)?;
        let after = embeddings.forward_t(&ids, false)?.squeeze(0)?.to_vec2::<f32>()?;
        assert_eq!(before[0], after[0]);
        assert_eq!(before[2], after[2]);
        assert_ne!(before[1], after[1]);
        Ok(())
    }
}
