//! Interleaved floating point raster and its conversion to and from `image`.

use crate::distortion::DistortionError;
use image::{DynamicImage, GrayAlphaImage, GrayImage, RgbImage, RgbaImage};

/// Row-major raster of `height × width` pixels with `channels` interleaved
/// `f64` samples each.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    width: usize,
    height: usize,
    channels: usize,
    data: Vec<f64>,
}

fn sample_count(width: usize, height: usize, channels: usize) -> Result<usize, DistortionError> {
    if width == 0 || height == 0 || channels == 0 {
        return Err(DistortionError::InvalidParameters(format!(
            "raster must not be empty, got {width}x{height} with {channels} channel(s)"
        )));
    }
    width
        .checked_mul(height)
        .and_then(|pixels| pixels.checked_mul(channels))
        .ok_or_else(|| {
            DistortionError::InvalidParameters(format!(
                "{width}x{height}x{channels} raster is too large to address"
            ))
        })
}

impl Raster {
    /// # Errors
    ///
    /// * [`DistortionError::InvalidParameters`] for an empty raster, zero
    ///   channels or a sample count that does not fit in `usize`.
    /// * [`DistortionError::ShapeMismatch`] if `data` does not hold
    ///   `width * height * channels` samples.
    pub fn new(width: usize, height: usize, channels: usize, data: Vec<f64>) -> Result<Self, DistortionError> {
        let expected = sample_count(width, height, channels)?;
        if data.len() != expected {
            return Err(DistortionError::ShapeMismatch(format!(
                "{width}x{height}x{channels} raster needs {expected} samples, got {}",
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            channels,
            data,
        })
    }

    pub fn filled(width: usize, height: usize, channels: usize, value: f64) -> Result<Self, DistortionError> {
        let count = sample_count(width, height, channels)?;
        Self::new(width, height, channels, vec![value; count])
    }

    /// Single-channel raster from a row-major slice of rows.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, DistortionError> {
        let width = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|row| row.len() != width) {
            return Err(DistortionError::ShapeMismatch("rows differ in length".to_string()));
        }
        Self::new(width, rows.len(), 1, rows.concat())
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    /// Samples of pixel `(x, y)`.
    pub fn pixel(&self, x: usize, y: usize) -> &[f64] {
        let start = (y * self.width + x) * self.channels;
        &self.data[start..start + self.channels]
    }

    pub fn pixel_mut(&mut self, x: usize, y: usize) -> &mut [f64] {
        let start = (y * self.width + x) * self.channels;
        &mut self.data[start..start + self.channels]
    }

    /// Samples of row `y`.
    pub fn row(&self, y: usize) -> &[f64] {
        let stride = self.width * self.channels;
        &self.data[y * stride..(y + 1) * stride]
    }

    /// Converts an 8-bit or wider image. Grey, grey+alpha, RGB and RGBA keep
    /// their channel count; samples are scaled to `0..=255`.
    pub fn from_dynamic_image(img: &DynamicImage) -> Result<Self, DistortionError> {
        let (width, height) = (img.width() as usize, img.height() as usize);
        let (channels, bytes) = match img.color().channel_count() {
            1 => (1, img.to_luma8().into_raw()),
            2 => (2, img.to_luma_alpha8().into_raw()),
            3 => (3, img.to_rgb8().into_raw()),
            4 => (4, img.to_rgba8().into_raw()),
            n => {
                return Err(DistortionError::InvalidParameters(format!(
                    "unsupported channel count {n}"
                )))
            }
        };
        Self::new(width, height, channels, bytes.into_iter().map(f64::from).collect())
    }

    /// Converts to an 8-bit image, rounding and clamping every sample to `0..=255`.
    pub fn to_dynamic_image(&self) -> Result<DynamicImage, DistortionError> {
        let bytes: Vec<u8> = self
            .data
            .iter()
            .map(|v| if v.is_finite() { v.round().clamp(0.0, 255.0) as u8 } else { 0 })
            .collect();
        let (w, h) = (self.width as u32, self.height as u32);
        let mismatch = || DistortionError::ShapeMismatch(format!("{w}x{h} buffer has the wrong size"));
        let img = match self.channels {
            1 => DynamicImage::ImageLuma8(GrayImage::from_raw(w, h, bytes).ok_or_else(mismatch)?),
            2 => DynamicImage::ImageLumaA8(GrayAlphaImage::from_raw(w, h, bytes).ok_or_else(mismatch)?),
            3 => DynamicImage::ImageRgb8(RgbImage::from_raw(w, h, bytes).ok_or_else(mismatch)?),
            4 => DynamicImage::ImageRgba8(RgbaImage::from_raw(w, h, bytes).ok_or_else(mismatch)?),
            n => {
                return Err(DistortionError::InvalidParameters(format!(
                    "cannot encode {n} channels as an 8-bit image"
                )))
            }
        };
        Ok(img)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_shapes() {
        assert!(matches!(
            Raster::new(0, 3, 1, vec![]),
            Err(DistortionError::InvalidParameters(_))
        ));
        assert!(matches!(
            Raster::new(2, 2, 3, vec![0.0; 11]),
            Err(DistortionError::ShapeMismatch(_))
        ));
        assert!(Raster::from_rows(&[vec![1.0, 2.0], vec![3.0]]).is_err());
    }

    #[test]
    fn test_rejects_unaddressable_size() {
        assert!(matches!(
            Raster::new(usize::MAX, 2, 1, vec![0.0; 4]),
            Err(DistortionError::InvalidParameters(_))
        ));
        assert!(matches!(
            Raster::filled(1 << 40, 1 << 40, 3, 0.0),
            Err(DistortionError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_pixel_access() {
        let mut raster = Raster::from_rows(&[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]).unwrap();
        assert_eq!(raster.pixel(2, 1), &[6.0]);
        assert_eq!(raster.row(0), &[1.0, 2.0, 3.0]);
        raster.pixel_mut(0, 1)[0] = 9.0;
        assert_eq!(raster.data()[3], 9.0);
    }

    #[test]
    fn test_dynamic_image_channels() {
        let grey = DynamicImage::ImageLuma8(GrayImage::from_raw(2, 1, vec![10, 250]).unwrap());
        let raster = Raster::from_dynamic_image(&grey).unwrap();
        assert_eq!(raster.channels(), 1);
        assert_eq!(raster.data(), &[10.0, 250.0]);

        let rgba = Raster::new(1, 1, 4, vec![1.4, 300.0, -5.0, 127.5]).unwrap();
        let img = rgba.to_dynamic_image().unwrap();
        assert_eq!(img.to_rgba8().into_raw(), vec![1, 255, 0, 128]);

        let five = Raster::new(1, 1, 5, vec![0.0; 5]).unwrap();
        assert!(five.to_dynamic_image().is_err());
    }
}
