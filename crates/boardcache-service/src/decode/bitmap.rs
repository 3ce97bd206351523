use std::fmt;
use std::io::Cursor;

use bytes::Bytes;
use image::{ImageError, ImageReader, Limits, RgbaImage};

use super::{DecodeHints, Decoder};
use crate::caching::{CacheEntry, CacheError};

/// A decoded image, stored as 8-bit RGBA.
#[derive(Clone)]
pub struct Bitmap {
    image: RgbaImage,
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}

impl Bitmap {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.image
    }

    /// The number of bytes the pixel buffer occupies.
    pub fn byte_count(&self) -> u64 {
        self.image.as_raw().len() as u64
    }

    pub fn into_inner(self) -> RgbaImage {
        self.image
    }
}

impl From<RgbaImage> for Bitmap {
    fn from(image: RgbaImage) -> Self {
        Self { image }
    }
}

/// Decodes GIF, JPEG, PNG and WebP images into [`Bitmap`]s.
///
/// Images larger than the [`DecodeHints`] are downscaled to fit them, keeping their aspect
/// ratio. Images are never upscaled.
#[derive(Debug, Clone, Copy)]
pub struct ImageDecoder {
    memory_limit: u64,
}

impl ImageDecoder {
    /// Creates a decoder that refuses to allocate more than `memory_limit` bytes per image.
    pub fn new(memory_limit: u64) -> Self {
        Self { memory_limit }
    }
}

impl Decoder for ImageDecoder {
    type Payload = Bitmap;

    fn decode(&self, data: Bytes, hints: &DecodeHints) -> CacheEntry<Bitmap> {
        if data.is_empty() {
            return Err(CacheError::Malformed("empty response body".into()));
        }

        let mut reader = ImageReader::new(Cursor::new(data.as_ref())).with_guessed_format()?;
        let Some(format) = reader.format() else {
            return Err(CacheError::Malformed("unrecognized image format".into()));
        };

        let mut limits = Limits::default();
        limits.max_alloc = Some(self.memory_limit);
        reader.limits(limits);

        let image = reader.decode().map_err(map_image_error)?;
        tracing::trace!(
            ?format,
            width = image.width(),
            height = image.height(),
            "Decoded image"
        );

        // Decoding is bounded by `max_alloc`, the resized RGBA output is checked here.
        let (width, height) = fit_within(image.width(), image.height(), hints);
        let decoded = image.as_bytes().len() as u64;
        let output = u64::from(width) * u64::from(height) * 4;
        if decoded.saturating_add(output) > self.memory_limit {
            return Err(CacheError::ResourceExhausted(format!(
                "converting to {width}x{height} RGBA needs {output} more bytes"
            )));
        }

        let image = if (width, height) == (image.width(), image.height()) {
            image
        } else {
            image.thumbnail_exact(width, height)
        };
        Ok(Bitmap {
            image: image.into_rgba8(),
        })
    }

    fn weight(payload: &Bitmap) -> u64 {
        payload.byte_count()
    }
}

fn map_image_error(err: ImageError) -> CacheError {
    match err {
        ImageError::Limits(err) => CacheError::ResourceExhausted(err.to_string()),
        // reading from memory only fails on truncated data
        ImageError::IoError(err) => CacheError::Malformed(err.to_string()),
        err => CacheError::Malformed(err.to_string()),
    }
}

/// The largest size within the hints that keeps the aspect ratio, without upscaling.
fn fit_within(width: u32, height: u32, hints: &DecodeHints) -> (u32, u32) {
    if !hints.is_constrained() || width == 0 || height == 0 {
        return (width, height);
    }

    let max_width = if hints.width == 0 { u32::MAX } else { hints.width };
    let max_height = if hints.height == 0 { u32::MAX } else { hints.height };
    if width <= max_width && height <= max_height {
        return (width, height);
    }

    let ratio = f64::min(
        f64::from(max_width) / f64::from(width),
        f64::from(max_height) / f64::from(height),
    );
    let scale = |len: u32, max: u32| ((f64::from(len) * ratio).round() as u32).clamp(1, max);
    (scale(width, max_width), scale(height, max_height))
}

#[cfg(test)]
mod tests {
    use image::{ImageFormat, Rgba};

    use super::*;

    const MIB: u64 = 1024 * 1024;

    fn png(width: u32, height: u32) -> Bytes {
        let image = RgbaImage::from_pixel(width, height, Rgba([0x11, 0x22, 0x33, 0xff]));
        let mut cursor = Cursor::new(Vec::new());
        image.write_to(&mut cursor, ImageFormat::Png).unwrap();
        Bytes::from(cursor.into_inner())
    }

    #[test]
    fn test_decode_unconstrained() {
        let bitmap = ImageDecoder::new(MIB)
            .decode(png(64, 32), &DecodeHints::default())
            .unwrap();

        assert_eq!((bitmap.width(), bitmap.height()), (64, 32));
        assert_eq!(ImageDecoder::weight(&bitmap), 64 * 32 * 4);
        assert_eq!(bitmap.pixels().get_pixel(0, 0), &Rgba([0x11, 0x22, 0x33, 0xff]));
    }

    #[test]
    fn test_decode_downscales_keeping_aspect() {
        let decoder = ImageDecoder::new(MIB);

        let bitmap = decoder.decode(png(64, 32), &DecodeHints::new(16, 16)).unwrap();
        assert_eq!((bitmap.width(), bitmap.height()), (16, 8));

        let bitmap = decoder.decode(png(64, 32), &DecodeHints::new(0, 8)).unwrap();
        assert_eq!((bitmap.width(), bitmap.height()), (16, 8));
    }

    #[test]
    fn test_decode_never_upscales() {
        let bitmap = ImageDecoder::new(MIB)
            .decode(png(10, 10), &DecodeHints::new(100, 100))
            .unwrap();
        assert_eq!((bitmap.width(), bitmap.height()), (10, 10));
    }

    #[test]
    fn test_decode_garbage() {
        let decoder = ImageDecoder::new(MIB);
        let hints = DecodeHints::default();

        assert!(matches!(
            decoder.decode(Bytes::new(), &hints),
            Err(CacheError::Malformed(_))
        ));
        assert!(matches!(
            decoder.decode(Bytes::from_static(b"<html>404</html>"), &hints),
            Err(CacheError::Malformed(_))
        ));

        let mut truncated = png(64, 64).to_vec();
        truncated.truncate(truncated.len() / 2);
        assert!(matches!(
            decoder.decode(Bytes::from(truncated), &hints),
            Err(CacheError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_memory_limit() {
        let result = ImageDecoder::new(1024).decode(png(256, 256), &DecodeHints::default());
        assert!(matches!(result, Err(CacheError::ResourceExhausted(_))));
    }

    #[test]
    fn test_conversion_memory_limit() {
        // the grayscale pixels fit, their RGBA conversion does not
        let image = image::GrayImage::from_pixel(256, 256, image::Luma([0x80]));
        let mut cursor = Cursor::new(Vec::new());
        image.write_to(&mut cursor, ImageFormat::Png).unwrap();
        let data = Bytes::from(cursor.into_inner());

        let decoder = ImageDecoder::new(200_000);
        let result = decoder.decode(data.clone(), &DecodeHints::default());
        assert!(matches!(result, Err(CacheError::ResourceExhausted(_))));

        // downscaled, the output fits again
        let bitmap = decoder.decode(data, &DecodeHints::new(128, 128)).unwrap();
        assert_eq!((bitmap.width(), bitmap.height()), (128, 128));
    }

    #[test]
    fn test_fit_within() {
        let hints = DecodeHints::new(16, 16);
        assert_eq!(fit_within(64, 32, &hints), (16, 8));
        assert_eq!(fit_within(32, 64, &hints), (8, 16));
        assert_eq!(fit_within(8, 8, &hints), (8, 8));
        assert_eq!(fit_within(1000, 1, &hints), (16, 1));
        assert_eq!(fit_within(64, 32, &DecodeHints::default()), (64, 32));
    }
}
