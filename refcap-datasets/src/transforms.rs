//! Image loading and preprocessing.
//!
//! Images keep their aspect ratio: they are only shrunk so that the longer side fits in
//! `max_size`, then normalised with the ImageNet statistics the backbones were trained with.
use crate::{Error, Result};
use candle::{DType, Device, Tensor};
use image::DynamicImage;
use std::path::Path;

pub const IMAGENET_MEAN: [f32; 3] = [0.485f32, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229f32, 0.224, 0.225];
pub const DEFAULT_MAX_SIZE: u32 = 299;

pub fn load_image<P: AsRef<Path>>(p: P) -> Result<DynamicImage> {
    let path = p.as_ref();
    let reader = image::ImageReader::open(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    reader.decode().map_err(|source| Error::Image {
        path: path.to_path_buf(),
        source,
    })
}

/// Crops a `[x, y, w, h]` pixel box, rounded outwards and clamped to the image. Returns `None`
/// when nothing of the box lies inside the image.
pub fn crop(image: &DynamicImage, bbox: [f32; 4]) -> Option<DynamicImage> {
    let [x, y, w, h] = bbox;
    if !(w > 0. && h > 0.) {
        return None;
    }
    let (width, height) = (image.width() as f32, image.height() as f32);
    let x0 = x.floor().max(0.);
    let y0 = y.floor().max(0.);
    let x1 = (x + w).ceil().min(width);
    let y1 = (y + h).ceil().min(height);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(image.crop_imm(
        x0 as u32,
        y0 as u32,
        (x1 - x0) as u32,
        (y1 - y0) as u32,
    ))
}

/// Converts an image to a `(3, height, width)` f32 tensor normalised with the ImageNet mean and
/// standard deviation.
pub fn normalize(image: &DynamicImage) -> Result<Tensor> {
    let image = image.to_rgb8();
    let (width, height) = (image.width() as usize, image.height() as usize);
    let data = image.into_raw();
    let data = Tensor::from_vec(data, (height, width, 3), &Device::Cpu)?.permute((2, 0, 1))?;
    let mean = Tensor::new(&IMAGENET_MEAN, &Device::Cpu)?.reshape((3, 1, 1))?;
    let std = Tensor::new(&IMAGENET_STD, &Device::Cpu)?.reshape((3, 1, 1))?;
    let data = (data.to_dtype(DType::F32)? / 255.)?
        .broadcast_sub(&mean)?
        .broadcast_div(&std)?;
    Ok(data)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTransform {
    max_size: u32,
}

impl Default for ImageTransform {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE)
    }
}

impl ImageTransform {
    pub fn new(max_size: u32) -> Self {
        Self { max_size }
    }

    pub fn max_size(&self) -> u32 {
        self.max_size
    }

    pub fn resize(&self, image: &DynamicImage) -> DynamicImage {
        if image.width().max(image.height()) <= self.max_size {
            return image.clone();
        }
        image.resize(
            self.max_size,
            self.max_size,
            image::imageops::FilterType::Triangle,
        )
    }

    pub fn apply(&self, image: &DynamicImage) -> Result<Tensor> {
        normalize(&self.resize(image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn checkerboard(width: u32, height: u32) -> DynamicImage {
        let image = RgbImage::from_fn(width, height, |x, y| {
            if (x + y) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        });
        DynamicImage::ImageRgb8(image)
    }

    #[test]
    fn resize_keeps_aspect_ratio() {
        let transform = ImageTransform::new(100);
        let resized = transform.resize(&checkerboard(400, 200));
        assert_eq!((resized.width(), resized.height()), (100, 50));
        let small = transform.resize(&checkerboard(60, 80));
        assert_eq!((small.width(), small.height()), (60, 80));
    }

    #[test]
    fn normalize_uses_channel_statistics() -> Result<()> {
        let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 2, Rgb([255, 0, 255])));
        let xs = normalize(&image)?;
        assert_eq!(xs.dims(), &[3, 2, 4]);
        let values = xs.flatten_from(1)?.max(1)?.to_vec1::<f32>()?;
        let expected = [
            (1. - IMAGENET_MEAN[0]) / IMAGENET_STD[0],
            -IMAGENET_MEAN[1] / IMAGENET_STD[1],
            (1. - IMAGENET_MEAN[2]) / IMAGENET_STD[2],
        ];
        for (v, e) in values.iter().zip(expected.iter()) {
            assert!((v - e).abs() < 1e-5, "{v} {e}");
        }
        Ok(())
    }

    #[test]
    fn crop_is_clamped_to_the_image() {
        let image = checkerboard(20, 10);
        let region = crop(&image, [15.5, 2., 10., 3.2]).unwrap();
        assert_eq!((region.width(), region.height()), (5, 4));
        assert!(crop(&image, [25., 2., 3., 3.]).is_none());
        assert!(crop(&image, [2., 2., 0., 3.]).is_none());
    }
}
