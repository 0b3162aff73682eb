use anyhow::{bail, Context, Result};
use image::imageops::{resize, FilterType};
use image::RgbImage;
use ndarray::Array4;

/// Per channel statistics the ResNet backbones were trained with.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Decodes an encoded image (png, jpeg, ...) into RGB, dropping alpha and expanding grayscale.
pub fn byte_data_to_image(im_bytes: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory(im_bytes).context("failed to decode image bytes")?;
    Ok(image.to_rgb8())
}

/// Resizes every image to `image_dim x image_dim` and stacks them into a normalised
/// `batch x 3 x image_dim x image_dim` tensor.
pub fn images_to_tensor(images: &[RgbImage], image_dim: u32) -> Result<Array4<f32>> {
    if image_dim == 0 {
        bail!("image dimension must be positive");
    }
    let side = image_dim as usize;
    let mut tensor = Array4::<f32>::zeros((images.len(), 3, side, side));

    for (i, image) in images.iter().enumerate() {
        if image.width() == 0 || image.height() == 0 {
            bail!("image {i} is empty");
        }
        let resized = resize(image, image_dim, image_dim, FilterType::Triangle);
        for (x, y, pixel) in resized.enumerate_pixels() {
            for channel in 0..3 {
                let value = pixel[channel] as f32 / 255.0;
                tensor[(i, channel, y as usize, x as usize)] =
                    (value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel];
            }
        }
    }

    tracing::debug!("built a {:?} image tensor", tensor.dim());
    Ok(tensor)
}
