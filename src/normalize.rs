//! Image normalization: bounded resize, JPEG re-encode, content fingerprint.
//!
//! Every still sent upstream passes through [`ImageNormalizer::normalize`].
//! The larger side is scaled down to `max_dimension` (never up), the result
//! is re-encoded as baseline JPEG at a fixed quality, and the encoded bytes
//! are fingerprinted.
//!
//! The operation holds no state between calls: identical input bytes always
//! produce byte-identical output and therefore the same fingerprint.

use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::DynamicImage;

use partscan_core::fingerprint::fingerprint;
use partscan_core::models::NormalizedImage;

use crate::config::NormalizeConfig;
use crate::error::{Result, ScanError};

#[derive(Debug, Clone)]
pub struct ImageNormalizer {
    max_dimension: u32,
    quality: u8,
    fingerprint_len: usize,
}

impl ImageNormalizer {
    pub fn new(config: &NormalizeConfig) -> Self {
        Self {
            max_dimension: config.max_dimension.max(1),
            quality: config.quality.clamp(1, 100),
            fingerprint_len: config.fingerprint_len,
        }
    }

    pub fn max_dimension(&self) -> u32 {
        self.max_dimension
    }

    /// Output dimensions for a `width × height` source.
    ///
    /// The larger side becomes exactly `max_dimension`; the other side is
    /// rounded to the nearest pixel and never drops below 1.
    pub fn target_dimensions(&self, width: u32, height: u32) -> (u32, u32) {
        let larger = width.max(height);
        if larger <= self.max_dimension {
            return (width, height);
        }

        let scale = self.max_dimension as f64 / larger as f64;
        let scaled = |side: u32| ((side as f64 * scale).round() as u32).max(1);

        if width >= height {
            (self.max_dimension, scaled(height))
        } else {
            (scaled(width), self.max_dimension)
        }
    }

    /// Decode `raw`, bound its size, re-encode, and fingerprint the result.
    pub fn normalize(&self, raw: &[u8]) -> Result<NormalizedImage> {
        if raw.is_empty() {
            return Err(ScanError::Decode("empty image payload".to_string()));
        }

        let decoded =
            image::load_from_memory(raw).map_err(|e| ScanError::Decode(e.to_string()))?;

        let (width, height) = self.target_dimensions(decoded.width(), decoded.height());
        let resized = if (width, height) == (decoded.width(), decoded.height()) {
            decoded
        } else {
            decoded.resize_exact(width, height, FilterType::Triangle)
        };

        let bytes = self.encode(&resized)?;
        let fingerprint = fingerprint(&bytes, self.fingerprint_len);

        Ok(NormalizedImage {
            bytes,
            width,
            height,
            fingerprint,
        })
    }

    /// Normalize each input independently, preserving order.
    pub fn normalize_batch<B: AsRef<[u8]>>(&self, inputs: &[B]) -> Vec<Result<NormalizedImage>> {
        inputs.iter().map(|raw| self.normalize(raw.as_ref())).collect()
    }

    fn encode(&self, image: &DynamicImage) -> Result<Vec<u8>> {
        // JPEG has no alpha channel
        let rgb = image.to_rgb8();
        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut buf, self.quality)
            .encode_image(&rgb)
            .map_err(|e| ScanError::Decode(format!("re-encode failed: {}", e)))?;
        Ok(buf)
    }
}

/// Decode a base64 image payload, accepting an optional `data:` URL prefix.
pub fn decode_image_payload(payload: &str) -> Result<Vec<u8>> {
    let trimmed = payload.trim();
    let encoded = match trimmed.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(";base64,")
            .map(|(_, data)| data)
            .ok_or_else(|| ScanError::Validation("data URL must be base64-encoded".to_string()))?,
        None => trimmed,
    };

    if encoded.is_empty() {
        return Err(ScanError::Validation("image payload is empty".to_string()));
    }

    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| ScanError::Validation(format!("image is not valid base64: {}", e)))
}

/// Encode a normalized image as a `data:` URL for upstream requests.
pub fn to_data_url(image: &NormalizedImage) -> String {
    format!(
        "data:{};base64,{}",
        NormalizedImage::MEDIA_TYPE,
        base64::engine::general_purpose::STANDARD.encode(&image.bytes)
    )
}
