//! Image codec collaborator: JPEG encode/decode over raw RGB8 buffers.

use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, GenericImageView};

use crate::error::{Error, Result};

pub trait ImageCodec: Send {
    /// Encodes a tightly-packed RGB8 buffer as JPEG at the given quality
    /// (1..100). `image`'s pure-Rust JPEG encoder has no chroma-subsampling
    /// knob at all: this implementation cannot vary subsampling by quality,
    /// and always encodes at whatever fixed sampling the encoder uses
    /// internally (see `DESIGN.md` for the gap this leaves against the
    /// quality-formula's subsampling step).
    fn encode(&self, rgb: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>>;

    /// Decodes a JPEG (or any format `image` recognizes) into a tightly
    /// packed RGB8 buffer plus its dimensions.
    fn decode(&self, bytes: &[u8]) -> Result<(u32, u32, Vec<u8>)>;
}

pub struct JpegCodec;

impl JpegCodec {
    pub fn new() -> Self {
        JpegCodec
    }
}

impl Default for JpegCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageCodec for JpegCodec {
    fn encode(&self, rgb: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
        encoder
            .encode(rgb, width, height, ColorType::Rgb8)
            .map_err(|e| Error::Codec(e.to_string()))?;
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<(u32, u32, Vec<u8>)> {
        let image = image::load_from_memory(bytes).map_err(|e| Error::Codec(e.to_string()))?;
        let (width, height) = image.dimensions();
        Ok((width, height, image.to_rgb8().into_raw()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_solid_tile() {
        let codec = JpegCodec::new();
        let rgb = vec![128u8; 16 * 16 * 3];
        let bytes = codec.encode(&rgb, 16, 16, 80).unwrap();
        let (w, h, decoded) = codec.decode(&bytes).unwrap();
        assert_eq!((w, h), (16, 16));
        assert_eq!(decoded.len(), rgb.len());
    }
}
