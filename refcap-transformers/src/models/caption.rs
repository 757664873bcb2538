//! Caption models for referring expressions.
//!
//! One model type covers three input configurations, chosen once at construction from two
//! flags:
//!
//! - target only: the backbone features of the target region form the single source stream.
//! - target + location: a 7-d location vector is projected to one extra, never masked,
//!   position appended after the target features.
//! - target + global + location: each of the `n` location values becomes its own position,
//!   and the whole image is encoded as a separate context stream.
//!
//! The backbone and the 1x1 input projection are shared by the target and the global image,
//! so both streams live in the same feature space.
use super::backbone::{Backbone, BackboneKind, ResNetBackbone};
use super::concat_transformer::{self, ConcatTransformer, Memory};
use super::with_tracing::{conv2d, linear, Conv2d, Linear};
use crate::{Error, FeatureStream, NestedTensor, Result};
use candle::{DType, Module, Tensor};
use candle_nn::VarBuilder;

pub const MLP_HIDDEN_DIM: usize = 512;
pub const MLP_NUM_LAYERS: usize = 3;

#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct Config {
    pub backbone: BackboneKind,
    pub hidden_dim: usize,
    pub vocab_size: usize,
    pub use_global_features: bool,
    pub use_location_features: bool,
    pub location_dim: usize,
    pub nheads: usize,
    pub enc_layers: usize,
    pub dec_layers: usize,
    pub dim_feedforward: usize,
    pub dropout: f32,
    pub pre_norm: bool,
    pub max_position_embeddings: usize,
    pub pad_token_id: usize,
    pub layer_norm_eps: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backbone: BackboneKind::Resnet101,
            hidden_dim: 256,
            vocab_size: 30522,
            use_global_features: false,
            use_location_features: false,
            location_dim: 7,
            nheads: 8,
            enc_layers: 6,
            dec_layers: 6,
            dim_feedforward: 2048,
            dropout: 0.1,
            pre_norm: true,
            max_position_embeddings: 128,
            pad_token_id: 0,
            layer_norm_eps: 1e-12,
        }
    }
}

impl Config {
    pub fn variant(&self) -> Result<Variant> {
        Variant::from_flags(self.use_global_features, self.use_location_features)
    }

    pub fn transformer_config(&self) -> concat_transformer::Config {
        concat_transformer::Config {
            d_model: self.hidden_dim,
            nheads: self.nheads,
            enc_layers: self.enc_layers,
            dec_layers: self.dec_layers,
            dim_feedforward: self.dim_feedforward,
            dropout: self.dropout,
            pre_norm: self.pre_norm,
            vocab_size: self.vocab_size,
            max_position_embeddings: self.max_position_embeddings,
            pad_token_id: self.pad_token_id,
            layer_norm_eps: self.layer_norm_eps,
            context_stream: self.use_global_features,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    TargetOnly,
    TargetLocation,
    TargetGlobalLocation,
}

impl Variant {
    pub fn from_flags(use_global: bool, use_location: bool) -> Result<Self> {
        match (use_global, use_location) {
            (false, false) => Ok(Self::TargetOnly),
            (false, true) => Ok(Self::TargetLocation),
            (true, true) => Ok(Self::TargetGlobalLocation),
            (true, false) => Err(Error::UnsupportedConfiguration {
                use_global,
                use_location,
            }),
        }
    }

    pub fn uses_location(&self) -> bool {
        !matches!(self, Self::TargetOnly)
    }

    pub fn uses_global(&self) -> bool {
        matches!(self, Self::TargetGlobalLocation)
    }
}

impl std::fmt::Display for Variant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::TargetOnly => "target-only",
            Self::TargetLocation => "target+location",
            Self::TargetGlobalLocation => "target+global+location",
        };
        f.write_str(name)
    }
}

/// The per-batch inputs of a caption model. Inputs that the model variant does not use are
/// ignored.
#[derive(Debug, Clone, Copy)]
pub struct CaptionInputs<'a> {
    pub target: &'a NestedTensor,
    pub global: Option<&'a NestedTensor>,
    pub location: Option<&'a Tensor>,
}

impl<'a> CaptionInputs<'a> {
    pub fn new(target: &'a NestedTensor) -> Self {
        Self {
            target,
            global: None,
            location: None,
        }
    }

    pub fn with_global(mut self, global: &'a NestedTensor) -> Self {
        self.global = Some(global);
        self
    }

    pub fn with_location(mut self, location: &'a Tensor) -> Self {
        self.location = Some(location);
        self
    }
}

/// The source streams handed to the transformer.
#[derive(Debug, Clone)]
pub struct EncoderStreams {
    pub target: FeatureStream,
    pub context: Option<FeatureStream>,
}

/// Backbone followed by the 1x1 projection to the hidden size, flattened to a stream.
struct ImageEncoder {
    backbone: Box<dyn Backbone>,
    input_proj: Conv2d,
}

impl ImageEncoder {
    fn new(backbone: Box<dyn Backbone>, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        let input_proj = conv2d(
            backbone.num_channels(),
            hidden_dim,
            1,
            Default::default(),
            vb.pp("input_proj"),
        )?;
        Ok(Self {
            backbone,
            input_proj,
        })
    }

    fn encode(&self, samples: &NestedTensor) -> Result<FeatureStream> {
        let features = self.backbone.extract(samples)?;
        let (src, mask) = features.decompose();
        let src = self.input_proj.forward(src)?.flatten_from(2)?;
        let mask = mask.flatten_from(1)?;
        FeatureStream::new(src, mask)
    }
}

/// Builds the encoder streams, holding the sub-modules only the chosen variant needs.
enum Assembler {
    TargetOnly,
    TargetLocation { loc_proj: Linear, location_dim: usize },
    TargetGlobalLocation { loc_proj: Linear },
}

impl Assembler {
    fn new(variant: Variant, cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let assembler = match variant {
            Variant::TargetOnly => Self::TargetOnly,
            Variant::TargetLocation => Self::TargetLocation {
                loc_proj: linear(cfg.location_dim, cfg.hidden_dim, vb.pp("loc_proj"))?,
                location_dim: cfg.location_dim,
            },
            Variant::TargetGlobalLocation => Self::TargetGlobalLocation {
                loc_proj: linear(1, cfg.hidden_dim, vb.pp("loc_proj"))?,
            },
        };
        Ok(assembler)
    }

    fn variant(&self) -> Variant {
        match self {
            Self::TargetOnly => Variant::TargetOnly,
            Self::TargetLocation { .. } => Variant::TargetLocation,
            Self::TargetGlobalLocation { .. } => Variant::TargetGlobalLocation,
        }
    }

    fn location<'a>(&self, inputs: &CaptionInputs<'a>) -> Result<&'a Tensor> {
        let location = inputs.location.ok_or(Error::MissingInput {
            variant: self.variant(),
            input: "location",
        })?;
        let b_sz = inputs.target.batch_size();
        let expected = match self {
            Self::TargetLocation { location_dim, .. } => Some(*location_dim),
            _ => None,
        };
        let valid = match (location.dims(), expected) {
            (&[b, n], Some(expected)) => b == b_sz && n == expected,
            (&[b, n], None) => b == b_sz && n > 0,
            _ => false,
        };
        if !valid {
            return Err(Error::UnexpectedLocationShape {
                variant: self.variant(),
                expected: match expected {
                    Some(_) => "(batch, location_dim)",
                    None => "(batch, n) with n > 0",
                },
                got: location.shape().clone(),
            });
        }
        Ok(location)
    }

    fn assemble(
        &self,
        encoder: &ImageEncoder,
        inputs: &CaptionInputs,
    ) -> Result<EncoderStreams> {
        let target = encoder.encode(inputs.target)?;
        match self {
            Self::TargetOnly => Ok(EncoderStreams {
                target,
                context: None,
            }),
            Self::TargetLocation { loc_proj, .. } => {
                let location = self.location(inputs)?;
                // (b, location_dim) -> (b, hidden, 1)
                let loc_src = loc_proj.forward(location)?.unsqueeze(2)?;
                let loc = FeatureStream::unmasked(loc_src)?;
                Ok(EncoderStreams {
                    target: target.concat(&loc)?,
                    context: None,
                })
            }
            Self::TargetGlobalLocation { loc_proj } => {
                let location = self.location(inputs)?;
                // (b, n) -> (b, n, 1) -> (b, n, hidden) -> (b, hidden, n)
                let loc_src = loc_proj
                    .forward(&location.unsqueeze(2)?)?
                    .transpose(1, 2)?
                    .contiguous()?;
                let loc = FeatureStream::unmasked(loc_src)?;
                let global = inputs.global.ok_or(Error::MissingInput {
                    variant: self.variant(),
                    input: "global image",
                })?;
                let context = encoder.encode(global)?.ensure_unmasked()?;
                Ok(EncoderStreams {
                    target: target.concat(&loc)?,
                    context: Some(context),
                })
            }
        }
    }
}

/// Very simple multi-layer perceptron, ReLU after every layer but the last.
#[derive(Debug, Clone)]
pub struct Mlp {
    layers: Vec<Linear>,
}

impl Mlp {
    pub fn new(
        input_dim: usize,
        hidden_dim: usize,
        output_dim: usize,
        num_layers: usize,
        vb: VarBuilder,
    ) -> candle::Result<Self> {
        let vb = vb.pp("layers");
        let mut layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let in_dim = if i == 0 { input_dim } else { hidden_dim };
            let out_dim = if i + 1 == num_layers {
                output_dim
            } else {
                hidden_dim
            };
            layers.push(linear(in_dim, out_dim, vb.pp(i))?)
        }
        Ok(Self { layers })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> candle::Result<Tensor> {
        let mut xs = xs.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(&xs)?;
            if i + 1 < self.layers.len() {
                xs = xs.relu()?
            }
        }
        Ok(xs)
    }
}

/// Token level cross entropy between `(batch, t, vocab)` logits and `(batch, t)` targets.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropyLoss;

impl CrossEntropyLoss {
    pub fn forward(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let (b_sz, t, vocab_size) = logits.dims3()?;
        let logits = logits.reshape((b_sz * t, vocab_size))?;
        let targets = targets.to_dtype(DType::U32)?.reshape(b_sz * t)?;
        Ok(candle_nn::loss::cross_entropy(&logits, &targets)?)
    }
}

pub struct CaptionModel {
    encoder: ImageEncoder,
    assembler: Assembler,
    transformer: ConcatTransformer,
    mlp: Mlp,
    span: tracing::Span,
}

impl CaptionModel {
    /// Builds a model around an arbitrary backbone. The parameters of the backbone are expected
    /// under the `backbone` prefix.
    pub fn with_backbone(
        cfg: &Config,
        backbone: Box<dyn Backbone>,
        vb: VarBuilder,
    ) -> Result<Self> {
        let variant = cfg.variant()?;
        let encoder = ImageEncoder::new(backbone, cfg.hidden_dim, vb.clone())?;
        let assembler = Assembler::new(variant, cfg, vb.clone())?;
        let transformer = ConcatTransformer::new(&cfg.transformer_config(), vb.pp("transformer"))?;
        let mlp = Mlp::new(
            cfg.hidden_dim,
            MLP_HIDDEN_DIM,
            cfg.vocab_size,
            MLP_NUM_LAYERS,
            vb.pp("mlp"),
        )?;
        let span = tracing::span!(tracing::Level::TRACE, "caption", variant = %variant);
        Ok(Self {
            encoder,
            assembler,
            transformer,
            mlp,
            span,
        })
    }

    pub fn variant(&self) -> Variant {
        self.assembler.variant()
    }

    /// The source streams for a batch, before the transformer.
    pub fn assemble(&self, inputs: &CaptionInputs) -> Result<EncoderStreams> {
        self.assembler.assemble(&self.encoder, inputs)
    }

    pub fn encode(&self, inputs: &CaptionInputs, train: bool) -> Result<Memory> {
        let _enter = self.span.enter();
        let streams = self.assemble(inputs)?;
        self.transformer
            .encode(&streams.target, streams.context.as_ref(), train)
    }

    /// Returns the `(batch, t, vocab)` logits and the last cross-attention weights.
    pub fn decode(
        &self,
        memory: &Memory,
        tgt: &Tensor,
        tgt_mask: &Tensor,
        train: bool,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let _enter = self.span.enter();
        let (hs, attention) = self.transformer.decode(memory, tgt, tgt_mask, train)?;
        let logits = self.mlp.forward(&hs)?;
        Ok((logits, attention))
    }

    pub fn forward_t(
        &self,
        inputs: &CaptionInputs,
        tgt: &Tensor,
        tgt_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let memory = self.encode(inputs, train)?;
        let (logits, _) = self.decode(&memory, tgt, tgt_mask, train)?;
        Ok(logits)
    }

    /// Inference forward pass, dropout disabled.
    pub fn forward(
        &self,
        inputs: &CaptionInputs,
        tgt: &Tensor,
        tgt_mask: &Tensor,
    ) -> Result<Tensor> {
        self.forward_t(inputs, tgt, tgt_mask, false)
    }

    pub fn forward_with_attention(
        &self,
        inputs: &CaptionInputs,
        tgt: &Tensor,
        tgt_mask: &Tensor,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let memory = self.encode(inputs, false)?;
        self.decode(&memory, tgt, tgt_mask, false)
    }
}

/// Builds the caption model selected by the configuration flags together with its training
/// criterion.
pub fn build_model(cfg: &Config, vb: VarBuilder) -> Result<(CaptionModel, CrossEntropyLoss)> {
    tracing::info!(
        use_global = cfg.use_global_features,
        use_location = cfg.use_location_features,
        "selecting caption model"
    );
    let variant = cfg.variant()?;
    let backbone = ResNetBackbone::new(cfg.backbone, vb.pp("backbone"))?;
    let model = CaptionModel::with_backbone(cfg, Box::new(backbone), vb)?;
    tracing::info!(
        %variant,
        backbone = %cfg.backbone,
        "built caption model with concat transformer"
    );
    Ok((model, CrossEntropyLoss))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_combinations() {
        assert_eq!(Variant::from_flags(false, false).unwrap(), Variant::TargetOnly);
        assert_eq!(Variant::from_flags(false, true).unwrap(), Variant::TargetLocation);
        assert_eq!(
            Variant::from_flags(true, true).unwrap(),
            Variant::TargetGlobalLocation
        );
        assert!(matches!(
            Variant::from_flags(true, false),
            Err(Error::UnsupportedConfiguration {
                use_global: true,
                use_location: false
            })
        ));
    }

    #[test]
    fn config_defaults_fill_missing_fields() -> serde_json::Result<()> {
        let cfg: Config = serde_json::from_str(
            r#"{"backbone": "resnet18", "use_location_features": true, "hidden_dim": 64}"#,
        )?;
        assert_eq!(cfg.backbone, BackboneKind::Resnet18);
        assert_eq!(cfg.hidden_dim, 64);
        assert_eq!(cfg.location_dim, 7);
        assert_eq!(cfg.variant().unwrap(), Variant::TargetLocation);
        assert!(!cfg.transformer_config().context_stream);
        Ok(())
    }
}
