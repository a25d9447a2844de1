use crate::error::InferenceError;
use base64::{prelude::BASE64_STANDARD, Engine};
use image::RgbImage;

/// Decodes an encoded raster image (format is sniffed from the bytes) into 8-bit RGB.
pub fn decode(bytes: &[u8]) -> Result<RgbImage, InferenceError> {
    if bytes.is_empty() {
        return Err(InferenceError::InvalidImage);
    }

    let image_reader = image::ImageReader::new(std::io::Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|_| InferenceError::InvalidImage)?;

    let image = image_reader.decode().map_err(|e| {
        tracing::debug!("Error decoding image: {}", e);
        InferenceError::InvalidImage
    })?;

    Ok(image.to_rgb8())
}

/// Strict base64 decoding with an optional `data:<mime>;base64,` prefix.
pub fn decode_base64(text: &str) -> Result<Vec<u8>, InferenceError> {
    let payload = match text.strip_prefix("data:") {
        Some(rest) => rest.split_once(',').map(|(_, data)| data).unwrap_or_default(),
        None => text,
    };

    BASE64_STANDARD
        .decode(payload)
        .map_err(|_| InferenceError::InvalidEncoding("Invalid base64 image payload.".into()))
}
