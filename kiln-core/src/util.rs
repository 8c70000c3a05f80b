use image::GenericImageView;

use crate::backend::PixelBuffer;

/// tEXt keyword carrying the generation-parameters record, the spelling
/// image tooling already understands.
const PARAMETERS_KEYWORD: &str = "parameters";

/// Encodes raw pixels into a self-contained PNG buffer, optionally embedding
/// the generation-parameters record as metadata. Empty buffers and unknown
/// channel layouts encode to nothing.
pub fn encode_png(image: &PixelBuffer, parameters: Option<&str>) -> Option<Vec<u8>> {
    if image.is_empty() {
        return None;
    }
    let color = match image.channels {
        1 => png::ColorType::Grayscale,
        3 => png::ColorType::Rgb,
        4 => png::ColorType::Rgba,
        _ => return None,
    };
    if image.data.len() != image.width as usize * image.height as usize * image.channels as usize {
        return None;
    }

    let mut bytes = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut bytes, image.width, image.height);
        encoder.set_color(color);
        encoder.set_depth(png::BitDepth::Eight);
        if let Some(parameters) = parameters {
            encoder
                .add_text_chunk(PARAMETERS_KEYWORD.to_string(), parameters.to_string())
                .ok()?;
        }
        let mut writer = encoder.write_header().ok()?;
        writer.write_image_data(&image.data).ok()?;
    }
    Some(bytes)
}

/// Decodes an encoded image (PNG/JPEG/...) into an owned RGB pixel buffer.
pub fn decode_rgb(bytes: &[u8]) -> Option<PixelBuffer> {
    let image = image::load_from_memory(bytes).ok()?;
    let (width, height) = image.dimensions();
    Some(PixelBuffer::new(width, height, 3, image.to_rgb8().into_raw()))
}

/// Decodes an encoded image into a single-channel (mask) pixel buffer.
pub fn decode_mask(bytes: &[u8]) -> Option<PixelBuffer> {
    let image = image::load_from_memory(bytes).ok()?;
    let (width, height) = image.dimensions();
    Some(PixelBuffer::new(width, height, 1, image.to_luma8().into_raw()))
}
