//! Image preprocessing for the recognition model
//!
//! Converts images to single-channel, fixed-size, unit-interval arrays and
//! stacks them into NCHW tensors.

use std::path::Path;

use candle_core::{Device, Tensor};
use image::{imageops::FilterType, GrayImage};
use ndarray::Array3;

use crate::error::{RecognitionError, Result};

/// Target input resolution (height, width) of the model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSize {
    pub height: u32,
    pub width: u32,
}

impl InputSize {
    pub fn new(height: u32, width: u32) -> Self {
        Self { height, width }
    }
}

/// Convert a grayscale image to a (1, H, W) array scaled to [0, 1]
pub fn gray_to_array(image: &GrayImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    Array3::from_shape_fn((1, height as usize, width as usize), |(_, y, x)| {
        image.get_pixel(x as u32, y as u32).0[0] as f32 / 255.0
    })
}

/// Resize (bilinear) to the model input size and normalize
pub fn prepare_gray(image: &GrayImage, size: InputSize) -> Array3<f32> {
    if image.dimensions() == (size.width, size.height) {
        return gray_to_array(image);
    }
    let resized = image::imageops::resize(image, size.width, size.height, FilterType::Triangle);
    gray_to_array(&resized)
}

/// Load an image file of any decodable format as a model-ready array
pub fn load_grayscale(path: &Path, size: InputSize) -> Result<Array3<f32>> {
    let image = image::open(path).map_err(|e| RecognitionError::image_load(path, e))?;
    Ok(prepare_gray(&image.to_luma8(), size))
}

/// Stack (1, H, W) arrays into a (B, 1, H, W) tensor
pub fn stack_images(images: &[Array3<f32>], device: &Device) -> Result<Tensor> {
    let Some(first) = images.first() else {
        return Err(candle_core::Error::Msg("cannot stack an empty batch".to_string()).into());
    };
    let (c, h, w) = first.dim();

    let mut data = Vec::with_capacity(images.len() * c * h * w);
    for image in images {
        if image.dim() != (c, h, w) {
            return Err(candle_core::Error::Msg(format!(
                "image shape {:?} does not match batch shape {:?}",
                image.dim(),
                (c, h, w)
            ))
            .into());
        }
        data.extend(image.iter().copied());
    }

    Ok(Tensor::from_vec(data, (images.len(), c, h, w), device)?)
}
