#![allow(dead_code)]
use candle::{DType, Device, Module, Tensor};
use candle_nn::{VarBuilder, VarMap};
use refcap_transformers::models::backbone::{downsample_mask, Backbone, BackboneKind};
use refcap_transformers::models::caption::{CaptionModel, Config};
use refcap_transformers::{NestedTensor, Result};

/// Non-overlapping 8x8 patches projected to a few channels, enough to exercise the shapes
/// without the cost of a ResNet.
pub struct PatchBackbone {
    conv: candle_nn::Conv2d,
    channels: usize,
}

pub const PATCH: usize = 8;

impl PatchBackbone {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = candle_nn::Conv2dConfig {
            stride: PATCH,
            ..Default::default()
        };
        let conv = candle_nn::conv2d(3, channels, PATCH, cfg, vb)?;
        Ok(Self { conv, channels })
    }
}

impl Backbone for PatchBackbone {
    fn num_channels(&self) -> usize {
        self.channels
    }

    fn extract(&self, samples: &NestedTensor) -> Result<NestedTensor> {
        let (xs, mask) = samples.decompose();
        let features = self.conv.forward(xs)?;
        let (_, _, h, w) = features.dims4()?;
        NestedTensor::new(features, downsample_mask(mask, h, w)?)
    }
}

pub fn small_config(use_global: bool, use_location: bool) -> Config {
    Config {
        backbone: BackboneKind::Resnet18,
        hidden_dim: 32,
        vocab_size: 50,
        use_global_features: use_global,
        use_location_features: use_location,
        nheads: 4,
        enc_layers: 1,
        dec_layers: 2,
        dim_feedforward: 64,
        max_position_embeddings: 16,
        ..Default::default()
    }
}

pub fn small_model(cfg: &Config, varmap: &VarMap) -> Result<CaptionModel> {
    let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
    let backbone = PatchBackbone::new(16, vb.pp("backbone"))?;
    CaptionModel::with_backbone(cfg, Box::new(backbone), vb)
}

pub fn images(sizes: &[(usize, usize)], seed: f64) -> Result<NestedTensor> {
    let images = sizes
        .iter()
        .enumerate()
        .map(|(i, &(h, w))| {
            let n = 3 * h * w;
            let data: Vec<f32> = (0..n)
                .map(|j| ((j as f64 * 0.37 + i as f64 + seed).sin()) as f32)
                .collect();
            Tensor::from_vec(data, (3, h, w), &Device::Cpu)
        })
        .collect::<candle::Result<Vec<_>>>()?;
    NestedTensor::from_tensor_list(&images)
}

pub fn location(b_sz: usize, n: usize) -> Result<Tensor> {
    let data: Vec<f32> = (0..b_sz * n).map(|i| (i % 7) as f32 / 7.).collect();
    Ok(Tensor::from_vec(data, (b_sz, n), &Device::Cpu)?)
}

pub fn tokens(b_sz: usize, t: usize) -> Result<(Tensor, Tensor)> {
    let ids: Vec<u32> = (0..b_sz * t).map(|i| (i % 40) as u32 + 1).collect();
    let ids = Tensor::from_vec(ids, (b_sz, t), &Device::Cpu)?;
    let mask = Tensor::zeros((b_sz, t), DType::U8, &Device::Cpu)?;
    Ok((ids, mask))
}
