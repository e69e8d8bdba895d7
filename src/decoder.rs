use crate::tensor::TENSOR_CHANNELS;
use image::{
    codecs::jpeg::JpegEncoder, DynamicImage, ImageDecoder as _, ImageError, ImageFormat,
    ImageReader,
};
use serde::Deserialize;
use std::io::Cursor;
use thiserror::Error;

/// Every decode path hands back interleaved RGBA samples.
pub const DECODED_CHANNELS: usize = 4;

pub const DEFAULT_JPEG_QUALITY: u8 = 90;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("failed to decode image: {0}")]
    Decode(#[from] ImageError),
    #[error("image reports {width}x{height}, width and height must both be positive")]
    MissingDimensions { width: u32, height: u32 },
    #[error("image has {0} channels, at least {min} are required", min = TENSOR_CHANNELS)]
    TooFewChannels(usize),
    #[error("pixel buffer holds {actual} samples, expected {expected}")]
    PixelCount { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DecodeStrategyKind {
    #[default]
    MetadataProbe,
    NormalizeToJpeg,
}

/// How uploaded bytes are turned into pixels. Fixed per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStrategy {
    /// Decode the upload directly, reading width and height from the
    /// format header before any pixel is touched.
    MetadataProbe,
    /// Re-encode the upload as a baseline JPEG first and decode that
    /// canonical buffer. Lossy, but every upload takes the same decoder.
    NormalizeToJpeg { quality: u8 },
}

impl DecodeStrategy {
    pub fn from_kind(kind: DecodeStrategyKind, jpeg_quality: u8) -> Self {
        match kind {
            DecodeStrategyKind::MetadataProbe => DecodeStrategy::MetadataProbe,
            DecodeStrategyKind::NormalizeToJpeg => DecodeStrategy::NormalizeToJpeg {
                quality: jpeg_quality,
            },
        }
    }
}

/// Raw pixels of one uploaded image, row-major and channel-interleaved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedImage {
    width: u32,
    height: u32,
    channels: usize,
    pixels: Vec<u8>,
}

impl DecodedImage {
    pub fn new(
        width: u32,
        height: u32,
        channels: usize,
        pixels: Vec<u8>,
    ) -> Result<Self, DecodeError> {
        require_dimensions(width, height)?;
        if channels < TENSOR_CHANNELS {
            return Err(DecodeError::TooFewChannels(channels));
        }
        let expected = width as usize * height as usize * channels;
        if pixels.len() != expected {
            return Err(DecodeError::PixelCount {
                expected,
                actual: pixels.len(),
            });
        }

        Ok(Self {
            width,
            height,
            channels,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

pub fn require_dimensions(width: u32, height: u32) -> Result<(), DecodeError> {
    if width == 0 || height == 0 {
        return Err(DecodeError::MissingDimensions { width, height });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct ImageDecoder {
    strategy: DecodeStrategy,
}

impl ImageDecoder {
    pub fn new(strategy: DecodeStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> DecodeStrategy {
        self.strategy
    }

    pub fn decode(&self, buffer: &[u8]) -> Result<DecodedImage, DecodeError> {
        match self.strategy {
            DecodeStrategy::MetadataProbe => probe_and_decode(buffer),
            DecodeStrategy::NormalizeToJpeg { quality } => {
                let canonical = normalize_to_jpeg(buffer, quality)?;
                tracing::debug!(
                    "Normalized {} byte upload to {} byte JPEG",
                    buffer.len(),
                    canonical.len()
                );
                decode_canonical_jpeg(&canonical)
            }
        }
    }
}

fn probe_and_decode(buffer: &[u8]) -> Result<DecodedImage, DecodeError> {
    let reader = ImageReader::new(Cursor::new(buffer))
        .with_guessed_format()
        .map_err(ImageError::IoError)?;

    let decoder = reader.into_decoder()?;
    let (width, height) = decoder.dimensions();
    require_dimensions(width, height)?;

    let rgba = DynamicImage::from_decoder(decoder)?.to_rgba8();
    DecodedImage::new(width, height, DECODED_CHANNELS, rgba.into_raw())
}

fn normalize_to_jpeg(buffer: &[u8], quality: u8) -> Result<Vec<u8>, DecodeError> {
    let image = image::load_from_memory(buffer)?;
    require_dimensions(image.width(), image.height())?;

    // JPEG carries no alpha; the 4th channel is dropped here, not blended.
    let rgb = image.to_rgb8();
    let mut canonical = Vec::new();
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut canonical, quality))?;

    Ok(canonical)
}

fn decode_canonical_jpeg(buffer: &[u8]) -> Result<DecodedImage, DecodeError> {
    let image = image::load_from_memory_with_format(buffer, ImageFormat::Jpeg)?;
    let (width, height) = (image.width(), image.height());
    require_dimensions(width, height)?;

    let rgba = image.to_rgba8();
    DecodedImage::new(width, height, DECODED_CHANNELS, rgba.into_raw())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::TENSOR_CHANNELS;
use image::{ImageBuffer, Rgb, Rgba};

    fn encode_png(img: &DynamicImage) -> Vec<u8> {
        let mut image_data: Vec<u8> = Vec::new();
        img.write_to(&mut Cursor::new(&mut image_data), ImageFormat::Png)
            .unwrap();
        image_data
    }

    #[test]
    fn test_metadata_probe_keeps_rgba_layout() {
        let img = ImageBuffer::<Rgba<u8>, Vec<u8>>::from_vec(
            2,
            1,
            vec![10, 20, 30, 255, 40, 50, 60, 0],
        )
        .unwrap();
        let image_data = encode_png(&DynamicImage::ImageRgba8(img));

        let decoded = ImageDecoder::new(DecodeStrategy::MetadataProbe)
            .decode(&image_data)
            .unwrap();

        assert_eq!(decoded.width(), 2);
        assert_eq!(decoded.height(), 1);
        assert_eq!(decoded.channels(), DECODED_CHANNELS);
        assert_eq!(decoded.pixels(), &[10, 20, 30, 255, 40, 50, 60, 0]);
    }

    #[test]
    fn test_metadata_probe_pads_rgb_sources_to_four_channels() {
        let img = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_pixel(3, 2, Rgb([1, 2, 3]));
        let image_data = encode_png(&DynamicImage::ImageRgb8(img));

        let decoded = ImageDecoder::new(DecodeStrategy::MetadataProbe)
            .decode(&image_data)
            .unwrap();

        assert_eq!(decoded.pixels().len(), 3 * 2 * DECODED_CHANNELS);
        assert_eq!(&decoded.pixels()[..4], &[1, 2, 3, 255]);
    }

    #[test]
    fn test_normalize_to_jpeg_decodes_png_upload() {
        let img = ImageBuffer::<Rgba<u8>, Vec<u8>>::from_pixel(16, 8, Rgba([200, 100, 50, 7]));
        let image_data = encode_png(&DynamicImage::ImageRgba8(img));

        let decoded = ImageDecoder::new(DecodeStrategy::NormalizeToJpeg { quality: 95 })
            .decode(&image_data)
            .unwrap();

        assert_eq!(decoded.width(), 16);
        assert_eq!(decoded.height(), 8);
        assert_eq!(decoded.pixels().len(), 16 * 8 * DECODED_CHANNELS);
        // JPEG is lossy, so only check the colour is roughly preserved
        // and that the padding channel is opaque rather than the source alpha.
        let first = &decoded.pixels()[..4];
        assert!(first[0].abs_diff(200) <= 4);
        assert!(first[1].abs_diff(100) <= 4);
        assert!(first[2].abs_diff(50) <= 4);
        assert_eq!(first[3], 255);
    }

    #[test]
    fn test_garbage_bytes_fail_to_decode() {
        let garbage = b"definitely not an image".to_vec();

        for strategy in [
            DecodeStrategy::MetadataProbe,
            DecodeStrategy::NormalizeToJpeg { quality: 90 },
        ] {
            let result = ImageDecoder::new(strategy).decode(&garbage);
            assert!(matches!(result, Err(DecodeError::Decode(_))));
        }
    }

    #[test]
    fn test_empty_buffer_fails_to_decode() {
        let result = ImageDecoder::new(DecodeStrategy::MetadataProbe).decode(&[]);
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_dimensions_are_rejected() {
        assert!(matches!(
            require_dimensions(0, 10),
            Err(DecodeError::MissingDimensions { width: 0, height: 10 })
        ));
        assert!(matches!(
            require_dimensions(10, 0),
            Err(DecodeError::MissingDimensions { .. })
        ));
        assert!(matches!(
            DecodedImage::new(0, 0, DECODED_CHANNELS, Vec::new()),
            Err(DecodeError::MissingDimensions { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_zero_dimension_headers() {
        let mut farbfeld = b"farbfeld".to_vec();
        farbfeld.extend_from_slice(&0u32.to_be_bytes());
        farbfeld.extend_from_slice(&1u32.to_be_bytes());
        let uploads: [&[u8]; 2] = [b"P6\n0 1\n255\n", &farbfeld];

        for strategy in [
            DecodeStrategy::MetadataProbe,
            DecodeStrategy::NormalizeToJpeg { quality: 90 },
        ] {
            for upload in uploads {
                let result = ImageDecoder::new(strategy).decode(upload);
                assert!(
                    matches!(
                        result,
                        Err(DecodeError::MissingDimensions { width: 0, height: 1 })
                    ),
                    "{:?}: {:?}",
                    strategy,
                    result
                );
            }
        }
    }

    #[test]
    fn test_fewer_than_three_channels_are_rejected() {
        assert!(matches!(
            DecodedImage::new(2, 1, 2, vec![0; 4]),
            Err(DecodeError::TooFewChannels(2))
        ));
        assert!(DecodedImage::new(2, 1, 3, vec![0; 6]).is_ok());
    }

    #[test]
    fn test_pixel_count_must_match_dimensions() {
        let result = DecodedImage::new(2, 2, DECODED_CHANNELS, vec![0; 15]);
        assert!(matches!(
            result,
            Err(DecodeError::PixelCount {
                expected: 16,
                actual: 15
            })
        ));
    }

    #[test]
    fn test_strategy_from_kind() {
        assert_eq!(
            DecodeStrategy::from_kind(DecodeStrategyKind::MetadataProbe, 80),
            DecodeStrategy::MetadataProbe
        );
        assert_eq!(
            DecodeStrategy::from_kind(DecodeStrategyKind::NormalizeToJpeg, 80),
            DecodeStrategy::NormalizeToJpeg { quality: 80 }
        );
    }
}
