//! Convolutional backbones producing spatial feature grids.
//!
//! The ResNet trunks follow "Deep Residual Learning for Image Recognition" He et al. 2015
//! <https://arxiv.org/abs/1512.03385> with the pooling and classification head removed, so
//! that the output of the last stage is kept as a `(batch, channels, h, w)` grid. Batch norm
//! layers always use their running statistics.
//!
//! The block builders keep the torchvision weight layout (`conv1`, `bn1`, `layer1.0.conv1`,
//! `layer1.0.downsample.0`, ...) that the candle ResNet uses, so ImageNet ResNet weights
//! load unchanged under the `backbone` prefix.
use crate::{NestedTensor, Result};
use candle::{DType, Tensor, D};
use candle_nn::{batch_norm, Conv2d, Func, VarBuilder};

/// Maps a padded image batch to a feature grid with a matching, downsampled padding mask.
pub trait Backbone {
    fn num_channels(&self) -> usize;

    fn extract(&self, samples: &NestedTensor) -> Result<NestedTensor>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackboneKind {
    Resnet18,
    Resnet34,
    Resnet50,
    Resnet101,
    Resnet152,
}

impl BackboneKind {
    pub fn num_channels(&self) -> usize {
        match self {
            Self::Resnet18 | Self::Resnet34 => 512,
            Self::Resnet50 | Self::Resnet101 | Self::Resnet152 => 2048,
        }
    }

    fn block_counts(&self) -> (usize, usize, usize, usize) {
        match self {
            Self::Resnet18 => (2, 2, 2, 2),
            Self::Resnet34 | Self::Resnet50 => (3, 4, 6, 3),
            Self::Resnet101 => (3, 4, 23, 3),
            Self::Resnet152 => (3, 8, 36, 3),
        }
    }
}

impl std::fmt::Display for BackboneKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Resnet18 => "resnet18",
            Self::Resnet34 => "resnet34",
            Self::Resnet50 => "resnet50",
            Self::Resnet101 => "resnet101",
            Self::Resnet152 => "resnet152",
        };
        f.write_str(name)
    }
}

fn conv2d(
    c_in: usize,
    c_out: usize,
    ksize: usize,
    padding: usize,
    stride: usize,
    vb: VarBuilder,
) -> candle::Result<Conv2d> {
    let conv2d_cfg = candle_nn::Conv2dConfig {
        stride,
        padding,
        ..Default::default()
    };
    candle_nn::conv2d_no_bias(c_in, c_out, ksize, conv2d_cfg, vb)
}

fn downsample(
    c_in: usize,
    c_out: usize,
    stride: usize,
    vb: VarBuilder,
) -> candle::Result<Func<'static>> {
    if stride != 1 || c_in != c_out {
        let conv = conv2d(c_in, c_out, 1, 0, stride, vb.pp(0))?;
        let bn = batch_norm(c_out, 1e-5, vb.pp(1))?;
        Ok(Func::new(move |xs| xs.apply(&conv)?.apply_t(&bn, false)))
    } else {
        Ok(Func::new(|xs| Ok(xs.clone())))
    }
}

fn basic_block(
    c_in: usize,
    c_out: usize,
    stride: usize,
    vb: VarBuilder,
) -> candle::Result<Func<'static>> {
    let conv1 = conv2d(c_in, c_out, 3, 1, stride, vb.pp("conv1"))?;
    let bn1 = batch_norm(c_out, 1e-5, vb.pp("bn1"))?;
    let conv2 = conv2d(c_out, c_out, 3, 1, 1, vb.pp("conv2"))?;
    let bn2 = batch_norm(c_out, 1e-5, vb.pp("bn2"))?;
    let downsample = downsample(c_in, c_out, stride, vb.pp("downsample"))?;
    Ok(Func::new(move |xs| {
        let ys = xs
            .apply(&conv1)?
            .apply_t(&bn1, false)?
            .relu()?
            .apply(&conv2)?
            .apply_t(&bn2, false)?;
        (xs.apply(&downsample)? + ys)?.relu()
    }))
}

fn bottleneck_block(
    c_in: usize,
    c_out: usize,
    stride: usize,
    vb: VarBuilder,
) -> candle::Result<Func<'static>> {
    let e_dim = 4 * c_out;
    let conv1 = conv2d(c_in, c_out, 1, 0, 1, vb.pp("conv1"))?;
    let bn1 = batch_norm(c_out, 1e-5, vb.pp("bn1"))?;
    let conv2 = conv2d(c_out, c_out, 3, 1, stride, vb.pp("conv2"))?;
    let bn2 = batch_norm(c_out, 1e-5, vb.pp("bn2"))?;
    let conv3 = conv2d(c_out, e_dim, 1, 0, 1, vb.pp("conv3"))?;
    let bn3 = batch_norm(e_dim, 1e-5, vb.pp("bn3"))?;
    let downsample = downsample(c_in, e_dim, stride, vb.pp("downsample"))?;
    Ok(Func::new(move |xs| {
        let ys = xs
            .apply(&conv1)?
            .apply_t(&bn1, false)?
            .relu()?
            .apply(&conv2)?
            .apply_t(&bn2, false)?
            .relu()?
            .apply(&conv3)?
            .apply_t(&bn3, false)?;
        (xs.apply(&downsample)? + ys)?.relu()
    }))
}

fn stage(
    c_in: usize,
    c_out: usize,
    stride: usize,
    cnt: usize,
    bottleneck: bool,
    vb: VarBuilder,
) -> candle::Result<Func<'static>> {
    let expansion = if bottleneck { 4 } else { 1 };
    let mut layers = Vec::with_capacity(cnt);
    for index in 0..cnt {
        let l_in = if index == 0 { c_in } else { expansion * c_out };
        let stride = if index == 0 { stride } else { 1 };
        let block = if bottleneck {
            bottleneck_block(l_in, c_out, stride, vb.pp(index))?
        } else {
            basic_block(l_in, c_out, stride, vb.pp(index))?
        };
        layers.push(block)
    }
    Ok(Func::new(move |xs| {
        let mut xs = xs.clone();
        for layer in layers.iter() {
            xs = xs.apply(layer)?
        }
        Ok(xs)
    }))
}

fn resnet_trunk(kind: BackboneKind, vb: VarBuilder) -> candle::Result<Func<'static>> {
    let (c1, c2, c3, c4) = kind.block_counts();
    let bottleneck = matches!(
        kind,
        BackboneKind::Resnet50 | BackboneKind::Resnet101 | BackboneKind::Resnet152
    );
    let e = if bottleneck { 4 } else { 1 };
    let conv1 = conv2d(3, 64, 7, 3, 2, vb.pp("conv1"))?;
    let bn1 = batch_norm(64, 1e-5, vb.pp("bn1"))?;
    let layer1 = stage(64, 64, 1, c1, bottleneck, vb.pp("layer1"))?;
    let layer2 = stage(e * 64, 128, 2, c2, bottleneck, vb.pp("layer2"))?;
    let layer3 = stage(e * 128, 256, 2, c3, bottleneck, vb.pp("layer3"))?;
    let layer4 = stage(e * 256, 512, 2, c4, bottleneck, vb.pp("layer4"))?;
    Ok(Func::new(move |xs| {
        xs.apply(&conv1)?
            .apply_t(&bn1, false)?
            .relu()?
            .pad_with_same(D::Minus1, 1, 1)?
            .pad_with_same(D::Minus2, 1, 1)?
            .max_pool2d_with_stride(3, 2)?
            .apply(&layer1)?
            .apply(&layer2)?
            .apply(&layer3)?
            .apply(&layer4)
    }))
}

pub struct ResNetBackbone {
    kind: BackboneKind,
    body: Func<'static>,
    span: tracing::Span,
}

impl ResNetBackbone {
    pub fn new(kind: BackboneKind, vb: VarBuilder) -> Result<Self> {
        let body = resnet_trunk(kind, vb)?;
        let span = tracing::span!(tracing::Level::TRACE, "backbone", kind = %kind);
        Ok(Self { kind, body, span })
    }

    pub fn kind(&self) -> BackboneKind {
        self.kind
    }
}

impl Backbone for ResNetBackbone {
    fn num_channels(&self) -> usize {
        self.kind.num_channels()
    }

    fn extract(&self, samples: &NestedTensor) -> Result<NestedTensor> {
        let _enter = self.span.enter();
        let (xs, mask) = samples.decompose();
        let features = xs.apply(&self.body)?;
        let (_b, _c, h, w) = features.dims4()?;
        let mask = downsample_mask(mask, h, w)?;
        NestedTensor::new(features, mask)
    }
}

/// Nearest-neighbour resize of a `(batch, height, width)` padding mask.
pub fn downsample_mask(mask: &Tensor, h: usize, w: usize) -> Result<Tensor> {
    let mask = mask
        .to_dtype(DType::F32)?
        .unsqueeze(1)?
        .upsample_nearest2d(h, w)?
        .squeeze(1)?
        .ge(0.5)?;
    Ok(mask)
}
