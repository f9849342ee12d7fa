use anyhow::{Context, Result};
use base64::Engine;
use image::{codecs::png::PngEncoder, ColorType, ImageEncoder};

/// Encode a channel-planar (CHW) RGB image with values in [0, 1] as a PNG data URL.
pub fn encode_chw_png_data_url(width: u32, height: u32, planes: &[f32]) -> Result<String> {
    let plane = (width * height) as usize;
    if planes.len() != plane * 3 {
        anyhow::bail!(
            "pixel buffer length {} does not match 3x{}x{} image",
            planes.len(),
            height,
            width
        );
    }

    let mut interleaved = Vec::with_capacity(plane * 3);
    for i in 0..plane {
        for channel in 0..3 {
            let value = planes[channel * plane + i].clamp(0.0, 1.0);
            interleaved.push((value * 255.0).round() as u8);
        }
    }

    let mut buffer = Vec::new();
    PngEncoder::new(&mut buffer)
        .write_image(&interleaved, width, height, ColorType::Rgb8)
        .context("failed to encode RGB PNG data")?;

    let base64 = base64::engine::general_purpose::STANDARD.encode(&buffer);
    Ok(format!("data:image/png;base64,{base64}"))
}
