/*!
 * Frame conversion.
 *
 * Turns a raw sensor buffer plus its [`FrameInfo`] into an [`Image`], applies
 * the camera's resize and rotation, and encodes images to disk.
 */
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

use chrono::{DateTime, Utc};
use image::codecs::bmp::BmpEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType as PngFilter, PngEncoder};
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, RgbImage};

use camflow_core::types::Rotation;

use crate::error::{DeviceError, Result};
use crate::sdk::{FrameInfo, ImageFileType, PixelType};

/// PNG compression level for [`Image::save`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PngCompression {
    /// Encoder default
    #[default]
    Default,
    /// Fast, larger files
    Fast,
    /// Slow, smaller files
    Best,
}

/// Options for [`Image::save`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveOptions {
    /// JPEG quality, clamped to 1..=100
    pub jpeg_quality: u8,
    /// PNG compression level
    pub png_compression: PngCompression,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            jpeg_quality: 95,
            png_compression: PngCompression::Default,
        }
    }
}

/// Resolve the container format from a path's extension
pub fn file_type_for(path: &Path) -> Result<ImageFileType> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => Ok(ImageFileType::Jpeg),
        "png" => Ok(ImageFileType::Png),
        "bmp" => Ok(ImageFileType::Bmp),
        _ => Err(DeviceError::UnsupportedFileFormat(ext)),
    }
}

fn encode_error(e: image::ImageError) -> DeviceError {
    DeviceError::Io(std::io::Error::other(e.to_string()))
}

/// A converted camera frame
#[derive(Debug, Clone)]
pub struct Image {
    /// Device frame counter
    pub frame_num: u32,
    /// Host time the frame was converted
    pub timestamp: DateTime<Utc>,
    /// Encoding of the raw frame
    pub pixel_type: PixelType,
    image: DynamicImage,
}

impl Image {
    /// Convert a raw frame; only Mono8 and RGB8 packed are supported
    pub fn from_raw(data: &[u8], info: &FrameInfo) -> Result<Self> {
        let channels = match info.pixel_type {
            PixelType::MONO8 => 1,
            PixelType::RGB8_PACKED => 3,
            other => return Err(DeviceError::UnsupportedFormat(other.to_string())),
        };

        let expected = info.width as usize * info.height as usize * channels;
        if data.len() < expected {
            return Err(DeviceError::InvalidArgument(format!(
                "frame of {} bytes is too short for {}x{} {}",
                data.len(),
                info.width,
                info.height,
                info.pixel_type
            )));
        }

        let pixels = data[..expected].to_vec();
        let image = if channels == 1 {
            GrayImage::from_raw(info.width, info.height, pixels).map(DynamicImage::ImageLuma8)
        } else {
            RgbImage::from_raw(info.width, info.height, pixels).map(DynamicImage::ImageRgb8)
        }
        .ok_or_else(|| DeviceError::UnsupportedFormat(info.pixel_type.to_string()))?;

        Ok(Self {
            frame_num: info.frame_num,
            timestamp: Utc::now(),
            pixel_type: info.pixel_type,
            image,
        })
    }

    /// Apply resize then rotation
    pub fn adjust(mut self, resize_ratio: f64, rotation: Rotation) -> Self {
        if resize_ratio > 0.0 && (resize_ratio - 1.0).abs() > f64::EPSILON {
            let width = ((self.image.width() as f64 * resize_ratio) as u32).max(1);
            let height = ((self.image.height() as f64 * resize_ratio) as u32).max(1);
            self.image = self.image.resize_exact(width, height, FilterType::Triangle);
        }

        self.image = match rotation {
            Rotation::Cw90 => self.image.rotate90(),
            Rotation::Cw180 => self.image.rotate180(),
            Rotation::Ccw90 => self.image.rotate270(),
            Rotation::None => self.image,
        };
        self
    }

    /// Width in pixels
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    /// Height in pixels
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Number of channels (1 for mono, 3 for RGB)
    pub fn channels(&self) -> u8 {
        self.image.color().channel_count()
    }

    /// Raw pixel bytes, row-major
    pub fn as_bytes(&self) -> &[u8] {
        self.image.as_bytes()
    }

    /// The underlying image
    pub fn as_dynamic(&self) -> &DynamicImage {
        &self.image
    }

    /// Take the underlying image
    pub fn into_dynamic(self) -> DynamicImage {
        self.image
    }

    /// Encode to a file, choosing the format by extension
    pub fn save<P: AsRef<Path>>(&self, path: P, options: &SaveOptions) -> Result<()> {
        let path = path.as_ref();
        let file_type = file_type_for(path)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut writer = BufWriter::new(File::create(path)?);
        match file_type {
            ImageFileType::Jpeg => {
                let quality = options.jpeg_quality.clamp(1, 100);
                let encoder = JpegEncoder::new_with_quality(&mut writer, quality);
                self.image.write_with_encoder(encoder).map_err(encode_error)?;
            }
            ImageFileType::Png => {
                let compression = match options.png_compression {
                    PngCompression::Default => CompressionType::Default,
                    PngCompression::Fast => CompressionType::Fast,
                    PngCompression::Best => CompressionType::Best,
                };
                let encoder = PngEncoder::new_with_quality(&mut writer, compression, PngFilter::Adaptive);
                self.image.write_with_encoder(encoder).map_err(encode_error)?;
            }
            ImageFileType::Bmp => {
                let encoder = BmpEncoder::new(&mut writer);
                self.image.write_with_encoder(encoder).map_err(encode_error)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(width: u32, height: u32, pixel_type: PixelType) -> FrameInfo {
        let bpp = pixel_type.bytes_per_pixel().unwrap_or(1);
        FrameInfo {
            width,
            height,
            pixel_type,
            frame_num: 7,
            frame_len: (width * height) as usize * bpp,
            host_timestamp: 0,
        }
    }

    #[test]
    fn test_mono_conversion() {
        let data: Vec<u8> = (0..12).collect();
        let image = Image::from_raw(&data, &info(4, 3, PixelType::MONO8)).unwrap();
        assert_eq!((image.width(), image.height(), image.channels()), (4, 3, 1));
        assert_eq!(image.frame_num, 7);
        assert_eq!(image.as_bytes(), &data[..]);
    }

    #[test]
    fn test_rgb_conversion() {
        let data = vec![10u8; 2 * 2 * 3];
        let image = Image::from_raw(&data, &info(2, 2, PixelType::RGB8_PACKED)).unwrap();
        assert_eq!(image.channels(), 3);
        assert_eq!(image.as_bytes().len(), 12);
    }

    #[test]
    fn test_unsupported_pixel_type() {
        let data = vec![0u8; 16];
        let err = Image::from_raw(&data, &info(4, 4, PixelType::BAYER_RG8)).unwrap_err();
        assert!(matches!(err, DeviceError::UnsupportedFormat(_)));
    }

    #[test]
    fn test_short_buffer() {
        let err = Image::from_raw(&[0u8; 3], &info(4, 4, PixelType::MONO8)).unwrap_err();
        assert!(matches!(err, DeviceError::InvalidArgument(_)));
    }

    #[test]
    fn test_adjust_resize_and_rotate() {
        let data = vec![0u8; 8 * 4];
        let image = Image::from_raw(&data, &info(8, 4, PixelType::MONO8)).unwrap();

        let image = image.adjust(0.5, Rotation::Cw90);
        assert_eq!((image.width(), image.height()), (2, 4));

        let image = image.adjust(1.0, Rotation::Cw180);
        assert_eq!((image.width(), image.height()), (2, 4));
    }

    #[test]
    fn test_rotation_direction() {
        // 2x1 image [a, b]: clockwise puts a on top, counter-clockwise puts b on top
        let image = Image::from_raw(&[1, 2], &info(2, 1, PixelType::MONO8)).unwrap();
        assert_eq!(image.clone().adjust(1.0, Rotation::Cw90).as_bytes(), &[1, 2]);
        assert_eq!(image.adjust(1.0, Rotation::Ccw90).as_bytes(), &[2, 1]);
    }

    #[test]
    fn test_save_formats() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..64).collect();
        let image = Image::from_raw(&data, &info(8, 8, PixelType::MONO8)).unwrap();

        for name in ["nested/a.jpg", "b.PNG", "c.bmp"] {
            let path = dir.path().join(name);
            image.save(&path, &SaveOptions::default()).unwrap();
            assert!(path.metadata().unwrap().len() > 0);
        }

        let err = image.save(dir.path().join("d.tiff"), &SaveOptions::default()).unwrap_err();
        assert!(matches!(err, DeviceError::UnsupportedFileFormat(ext) if ext == "tiff"));
    }

    #[test]
    fn test_file_type_for() {
        assert_eq!(file_type_for(Path::new("x.JPEG")).unwrap(), ImageFileType::Jpeg);
        assert!(file_type_for(Path::new("noext")).is_err());
    }
}
