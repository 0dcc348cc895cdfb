use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use image::imageops::FilterType;
use image::io::Reader as ImageReader;
use image::{DynamicImage, GenericImageView, ImageFormat, Limits};
use metrics::{counter, histogram};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{instrument, warn};

/// Square edge length the pest model was trained on.
pub const DEFAULT_INPUT_SIZE: u32 = 224;

/// Number of color channels fed to the model (RGB).
pub const CHANNELS: usize = 3;

#[derive(Debug, Error)]
pub enum ImageProcessingError {
    #[error("failed to decode image: {source}")]
    Decode {
        #[from]
        source: image::ImageError,
    },

    #[error("image too large: {width}x{height} = {pixels} pixels, max {max_pixels}")]
    ImageTooLarge {
        width: u32,
        height: u32,
        pixels: u64,
        max_pixels: u64,
    },

    #[error("input too large: {size} bytes, max {max_size}")]
    InputTooLarge { size: usize, max_size: usize },

    #[error("input bytes empty")]
    EmptyInput,

    #[error("unsupported image format")]
    UnsupportedFormat,

    #[error("preprocessing task aborted")]
    Aborted,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Set from the model section; never read from the preprocess section.
    #[serde(skip)]
    pub input_size: u32,
    /// Optional caps; unset means any decodable image is accepted.
    pub max_image_pixels: Option<u64>,
    pub max_input_bytes: Option<usize>,
    pub max_dimension: Option<u32>,
    /// Decoder allocation guard.
    pub max_alloc_bytes: u64,
    /// Decodes allowed to run at once; further callers wait for a slot.
    pub max_concurrent_ops: usize,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            input_size: DEFAULT_INPUT_SIZE,
            max_image_pixels: None,
            max_input_bytes: None,
            max_dimension: None,
            max_alloc_bytes: 512 * 1024 * 1024,
            max_concurrent_ops: 4,
        }
    }
}

/// Channel-last float tensor of shape `size x size x 3`, values in `[0, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageTensor {
    size: u32,
    data: Vec<f32>,
}

impl ImageTensor {
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Row-major HWC values.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// `[height, width, channels]`
    pub fn shape(&self) -> [usize; 3] {
        [self.size as usize, self.size as usize, CHANNELS]
    }
}

pub struct ImagePreprocessor {
    config: PreprocessConfig,
    semaphore: Arc<Semaphore>,
}

impl ImagePreprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_ops.max(1)));
        Self { config, semaphore }
    }

    pub fn with_defaults() -> Self {
        Self::new(PreprocessConfig::default())
    }

    pub fn input_size(&self) -> u32 {
        self.config.input_size
    }

    #[instrument(skip(self, raw_bytes), fields(input_size = raw_bytes.len()))]
    pub async fn preprocess(
        &self,
        raw_bytes: Arc<[u8]>,
    ) -> Result<ImageTensor, ImageProcessingError> {
        let start = Instant::now();
        counter!("image.preprocess.requests").increment(1);

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ImageProcessingError::Aborted)?;

        let config = self.config.clone();
        let result = tokio::task::spawn_blocking(move || preprocess_sync(&config, &raw_bytes))
            .await
            .map_err(|_| ImageProcessingError::Aborted)?;

        histogram!("image.preprocess.duration_ms").record(start.elapsed().as_millis() as f64);

        if let Err(e) = &result {
            counter!("image.preprocess.errors").increment(1);
            warn!(error = %e, "preprocess failed");
        }

        result
    }
}

/// Decodes, converts to RGB, resizes to the square model input and scales
/// intensities into `[0, 1]`. Aspect ratio is not preserved.
pub fn preprocess_sync(
    config: &PreprocessConfig,
    raw_bytes: &[u8],
) -> Result<ImageTensor, ImageProcessingError> {
    let img = decode_image(config, raw_bytes)?;
    let rgb = img.to_rgb8();

    let size = config.input_size;
    let resized = image::imageops::resize(&rgb, size, size, FilterType::CatmullRom);

    let data = resized
        .as_raw()
        .iter()
        .map(|&v| f32::from(v) / 255.0)
        .collect::<Vec<_>>();

    Ok(ImageTensor { size, data })
}

/// File extension for the sniffed format, `bin` when unknown.
pub fn sniff_extension(raw_bytes: &[u8]) -> &'static str {
    image::guess_format(raw_bytes)
        .ok()
        .and_then(|format| format.extensions_str().first().copied())
        .unwrap_or("bin")
}

/// Content type for the sniffed format.
pub fn sniff_content_type(raw_bytes: &[u8]) -> &'static str {
    match image::guess_format(raw_bytes) {
        Ok(ImageFormat::Png) => "image/png",
        Ok(ImageFormat::Jpeg) => "image/jpeg",
        Ok(ImageFormat::WebP) => "image/webp",
        _ => "application/octet-stream",
    }
}

fn decode_image(
    config: &PreprocessConfig,
    raw_bytes: &[u8],
) -> Result<DynamicImage, ImageProcessingError> {
    if raw_bytes.is_empty() {
        return Err(ImageProcessingError::EmptyInput);
    }

    if let Some(max_size) = config.max_input_bytes {
        if raw_bytes.len() > max_size {
            return Err(ImageProcessingError::InputTooLarge {
                size: raw_bytes.len(),
                max_size,
            });
        }
    }

    let mut reader = ImageReader::new(Cursor::new(raw_bytes))
        .with_guessed_format()
        .map_err(|e| ImageProcessingError::Decode { source: e.into() })?;

    if reader.format().is_none() {
        return Err(ImageProcessingError::UnsupportedFormat);
    }

    let mut limits = Limits::default();
    limits.max_image_width = config.max_dimension;
    limits.max_image_height = config.max_dimension;
    limits.max_alloc = Some(config.max_alloc_bytes);
    reader.limits(limits);

    let img = reader.decode()?;
    let (w, h) = img.dimensions();
    let pixels = u64::from(w) * u64::from(h);

    if let Some(max_pixels) = config.max_image_pixels {
        if pixels > max_pixels {
            return Err(ImageProcessingError::ImageTooLarge {
                width: w,
                height: h,
                pixels,
                max_pixels,
            });
        }
    }

    Ok(img)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ExtendedColorType, ImageEncoder};
    use proptest::prelude::*;

    pub(crate) fn create_test_png(width: u32, height: u32) -> Vec<u8> {
        use image::{ImageBuffer, Rgba};
        let img: ImageBuffer<Rgba<u8>, Vec<u8>> = ImageBuffer::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8, 255])
        });
        let mut buffer = Vec::new();
        let encoder = image::codecs::png::PngEncoder::new(&mut buffer);
        encoder
            .write_image(img.as_raw(), width, height, ExtendedColorType::Rgba8)
            .unwrap();
        buffer
    }

    fn create_gray_png(width: u32, height: u32, level: u8) -> Vec<u8> {
        let img = image::GrayImage::from_pixel(width, height, image::Luma([level]));
        let mut buffer = Vec::new();
        image::codecs::png::PngEncoder::new(&mut buffer)
            .write_image(img.as_raw(), width, height, ExtendedColorType::L8)
            .unwrap();
        buffer
    }

    #[test]
    fn decode_rejects_empty() {
        let config = PreprocessConfig::default();
        assert!(matches!(
            decode_image(&config, &[]),
            Err(ImageProcessingError::EmptyInput)
        ));
    }

    #[test]
    fn decode_rejects_garbage() {
        let config = PreprocessConfig::default();
        let err = decode_image(&config, &[0xFF, 0xFE, 0x00]).unwrap_err();
        assert!(matches!(
            err,
            ImageProcessingError::UnsupportedFormat | ImageProcessingError::Decode { .. }
        ));
    }

    #[test]
    fn decode_rejects_truncated_png() {
        let config = PreprocessConfig::default();
        let png = create_test_png(32, 32);
        assert!(decode_image(&config, &png[..png.len() / 2]).is_err());
    }

    #[test]
    fn decode_rejects_oversized_input() {
        let config = PreprocessConfig {
            max_input_bytes: Some(100),
            ..Default::default()
        };
        let data = vec![0u8; 101];
        let result = decode_image(&config, &data);
        assert!(matches!(result, Err(ImageProcessingError::InputTooLarge { .. })));
    }

    #[test]
    fn preprocess_produces_model_geometry() {
        let config = PreprocessConfig::default();
        let png = create_test_png(300, 120);

        let tensor = preprocess_sync(&config, &png).unwrap();

        assert_eq!(tensor.shape(), [224, 224, 3]);
        assert_eq!(tensor.data().len(), 224 * 224 * 3);
        assert!(tensor.data().iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn grayscale_expands_to_three_channels() {
        let config = PreprocessConfig {
            input_size: 8,
            ..Default::default()
        };
        let png = create_gray_png(16, 16, 51);

        let tensor = preprocess_sync(&config, &png).unwrap();

        assert_eq!(tensor.data().len(), 8 * 8 * 3);
        for v in tensor.data() {
            assert!((v - 0.2).abs() < 1e-6);
        }
    }

    #[test]
    fn sniffing_reports_png() {
        let png = create_test_png(4, 4);
        assert_eq!(sniff_extension(&png), "png");
        assert_eq!(sniff_content_type(&png), "image/png");
        assert_eq!(sniff_extension(b"nope"), "bin");
    }

    #[test]
    fn size_caps_are_opt_in() {
        let png = create_test_png(120, 80);
        let defaults = PreprocessConfig::default();
        assert!(defaults.max_input_bytes.is_none());
        assert!(defaults.max_image_pixels.is_none());
        assert!(decode_image(&defaults, &png).is_ok());

        let capped = PreprocessConfig {
            max_input_bytes: Some(png.len() - 1),
            ..Default::default()
        };
        assert!(matches!(
            decode_image(&capped, &png),
            Err(ImageProcessingError::InputTooLarge { .. })
        ));

        let capped = PreprocessConfig {
            max_image_pixels: Some(120 * 80 - 1),
            ..Default::default()
        };
        assert!(matches!(
            decode_image(&capped, &png),
            Err(ImageProcessingError::ImageTooLarge { .. })
        ));
    }

    #[test]
    fn input_above_former_byte_limit_decodes() {
        // Noise defeats compression, so the encoding stays above 50 MiB.
        let side = 3700;
        let mut state = 0x2545_f491_u32;
        let img = image::RgbaImage::from_fn(side, side, |_, _| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            image::Rgba(state.to_le_bytes())
        });
        let mut png = Vec::new();
        image::codecs::png::PngEncoder::new_with_quality(
            &mut png,
            image::codecs::png::CompressionType::Fast,
            image::codecs::png::FilterType::NoFilter,
        )
        .write_image(img.as_raw(), side, side, ExtendedColorType::Rgba8)
        .unwrap();
        assert!(png.len() > 50 * 1024 * 1024);

        let config = PreprocessConfig {
            input_size: 8,
            ..Default::default()
        };
        let tensor = preprocess_sync(&config, &png).unwrap();
        assert_eq!(tensor.shape(), [8, 8, 3]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn saturated_preprocessor_queues_instead_of_rejecting() {
        let config = PreprocessConfig {
            max_concurrent_ops: 1,
            input_size: 16,
            ..Default::default()
        };
        let processor = Arc::new(ImagePreprocessor::new(config));
        let png: Arc<[u8]> = create_test_png(50, 50).into();

        let held = processor.semaphore.try_acquire().unwrap();
        let waiting = {
            let processor = Arc::clone(&processor);
            let png = Arc::clone(&png);
            tokio::spawn(async move { processor.preprocess(png).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        drop(held);
        let tensor = waiting.await.unwrap().unwrap();
        assert_eq!(tensor.size(), 16);
    }

    #[tokio::test]
    async fn preprocessor_runs_off_thread() {
        let processor = ImagePreprocessor::with_defaults();
        let png: Arc<[u8]> = create_test_png(64, 48).into();

        let tensor = processor.preprocess(png).await.unwrap();
        assert_eq!(tensor.size(), DEFAULT_INPUT_SIZE);
    }

    proptest! {
        #[test]
        fn any_geometry_maps_to_square_input(w in 1u32..64, h in 1u32..64) {
            let config = PreprocessConfig { input_size: 16, ..Default::default() };
            let png = create_test_png(w, h);
            let tensor = preprocess_sync(&config, &png).unwrap();
            prop_assert_eq!(tensor.shape(), [16, 16, 3]);
            prop_assert!(tensor.data().iter().all(|v| (0.0..=1.0).contains(v)));
        }
    }
}
