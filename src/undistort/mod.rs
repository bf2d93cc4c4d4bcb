//! Image resampling that removes lens distortion.
//!
//! [`remove_distortion`] builds a dense grid of output pixel coordinates,
//! maps every coordinate through the model's inverse transform and samples
//! the source raster bilinearly at the result. With
//! [`UndistortOptions::reshape`] the output canvas is grown to the span of
//! the distorted image corners and the grid is offset by the lower-left
//! corner.

use crate::distortion::{DistortionError, DistortionKernel};
use crate::jobs::CancellationToken;
use log::debug;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

pub mod raster;

pub use raster::Raster;

/// Largest output canvas, in pixels, that [`remove_distortion`] will allocate.
pub const MAX_CANVAS_PIXELS: usize = 1 << 28;

/// Coordinates within this distance outside the source still count as inside.
const EDGE_TOLERANCE: f64 = 1e-6;

/// Value used for samples that fall outside the source image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryMode {
    /// Outside samples take this value in every channel.
    Constant(f64),
    /// Outside samples take the value of the nearest edge pixel.
    Clamp,
}

impl Default for BoundaryMode {
    fn default() -> Self {
        BoundaryMode::Constant(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UndistortOptions {
    /// Grow the canvas to the span of the distorted corners.
    pub reshape: bool,
    pub boundary: BoundaryMode,
}

impl Default for UndistortOptions {
    fn default() -> Self {
        Self {
            reshape: true,
            boundary: BoundaryMode::default(),
        }
    }
}

/// Output of [`remove_distortion`]. Output pixel `(j, i)` corresponds to the
/// coordinate `lower_left + (j, i)`.
#[derive(Debug, Clone, PartialEq)]
pub struct UndistortedImage {
    pub image: Raster,
    pub lower_left: Vector2<f64>,
    pub upper_right: Vector2<f64>,
}

/// Resamples `image` through the inverse of `model`.
///
/// # Errors
///
/// [`DistortionError::DegenerateCanvas`] when the corner span is not finite,
/// is negative, or is zero along an axis where the source has more than one
/// pixel.
pub fn remove_distortion<K>(
    model: &K,
    image: &Raster,
    options: &UndistortOptions,
) -> Result<UndistortedImage, DistortionError>
where
    K: DistortionKernel + ?Sized,
{
    resample(model, image, options, None)
}

/// [`remove_distortion`] that gives up with [`DistortionError::Cancelled`]
/// once `token` is cancelled. The token is checked before every output row.
pub fn remove_distortion_with_cancel<K>(
    model: &K,
    image: &Raster,
    options: &UndistortOptions,
    token: &CancellationToken,
) -> Result<UndistortedImage, DistortionError>
where
    K: DistortionKernel + ?Sized,
{
    resample(model, image, options, Some(token))
}

fn resample<K>(
    model: &K,
    image: &Raster,
    options: &UndistortOptions,
    token: Option<&CancellationToken>,
) -> Result<UndistortedImage, DistortionError>
where
    K: DistortionKernel + ?Sized,
{
    let (width, height) = (image.width(), image.height());
    let last = Vector2::new((width - 1) as f64, (height - 1) as f64);
    let (lower_left, upper_right) = if options.reshape {
        (model.distort(&Vector2::zeros()), model.distort(&last))
    } else {
        (Vector2::zeros(), last)
    };

    let out_width = canvas_extent(lower_left.x, upper_right.x, width)
        .ok_or_else(|| degenerate(&lower_left, &upper_right))?;
    let out_height = canvas_extent(lower_left.y, upper_right.y, height)
        .ok_or_else(|| degenerate(&lower_left, &upper_right))?;
    if out_width.saturating_mul(out_height) > MAX_CANVAS_PIXELS {
        return Err(degenerate(&lower_left, &upper_right));
    }
    debug!(
        "Resampling {}x{} -> {}x{} canvas from ({:.3}, {:.3})",
        width, height, out_width, out_height, lower_left.x, lower_left.y
    );

    let channels = image.channels();
    let mut data = Vec::with_capacity(out_width * out_height * channels);
    let mut sample = vec![0.0; channels];
    for i in 0..out_height {
        if token.is_some_and(CancellationToken::is_cancelled) {
            debug!("Resampling cancelled at row {}", i);
            return Err(DistortionError::Cancelled);
        }
        for j in 0..out_width {
            let target = Vector2::new(lower_left.x + j as f64, lower_left.y + i as f64);
            let source = model.undistort(&target);
            bilinear_sample(image, source.x, source.y, options.boundary, &mut sample);
            data.extend_from_slice(&sample);
        }
    }

    Ok(UndistortedImage {
        image: Raster::new(out_width, out_height, channels, data)?,
        lower_left,
        upper_right,
    })
}

fn degenerate(lower_left: &Vector2<f64>, upper_right: &Vector2<f64>) -> DistortionError {
    DistortionError::DegenerateCanvas {
        lower_left: (lower_left.x, lower_left.y),
        upper_right: (upper_right.x, upper_right.y),
    }
}

/// Pixels along one axis of the output canvas, `floor(span) + 1`. A source
/// axis of a single pixel always yields a single output pixel.
fn canvas_extent(low: f64, high: f64, source_len: usize) -> Option<usize> {
    let span = high - low;
    if !span.is_finite() {
        return None;
    }
    if source_len == 1 {
        return Some(1);
    }
    if span <= 0.0 {
        return None;
    }
    let extent = (span + 1e-9).floor() + 1.0;
    if extent > MAX_CANVAS_PIXELS as f64 {
        return None;
    }
    Some(extent as usize)
}

/// Writes the bilinear interpolation of `image` at `(x, y)` into `out`.
fn bilinear_sample(image: &Raster, x: f64, y: f64, boundary: BoundaryMode, out: &mut [f64]) {
    let max_x = (image.width() - 1) as f64;
    let max_y = (image.height() - 1) as f64;

    let inside = x.is_finite()
        && y.is_finite()
        && x >= -EDGE_TOLERANCE
        && y >= -EDGE_TOLERANCE
        && x <= max_x + EDGE_TOLERANCE
        && y <= max_y + EDGE_TOLERANCE;
    if !inside {
        match boundary {
            BoundaryMode::Constant(value) => {
                out.fill(value);
                return;
            }
            BoundaryMode::Clamp if !(x.is_finite() && y.is_finite()) => {
                out.fill(0.0);
                return;
            }
            BoundaryMode::Clamp => {}
        }
    }

    let x = x.clamp(0.0, max_x);
    let y = y.clamp(0.0, max_y);
    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(image.width() - 1);
    let y1 = (y0 + 1).min(image.height() - 1);
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let p00 = image.pixel(x0, y0);
    let p10 = image.pixel(x1, y0);
    let p01 = image.pixel(x0, y1);
    let p11 = image.pixel(x1, y1);
    for (c, value) in out.iter_mut().enumerate() {
        let top = p00[c] * (1.0 - fx) + p10[c] * fx;
        let bottom = p01[c] * (1.0 - fx) + p11[c] * fx;
        *value = top * (1.0 - fy) + bottom * fy;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distortion::{DistortionModel, DistortionParameters};
    use approx::assert_relative_eq;

    fn gradient(width: usize, height: usize, channels: usize) -> Raster {
        let mut data = Vec::with_capacity(width * height * channels);
        for y in 0..height {
            for x in 0..width {
                for c in 0..channels {
                    data.push((x * 3 + y * 5 + c * 11) as f64);
                }
            }
        }
        Raster::new(width, height, channels, data).unwrap()
    }

    fn identity(width: u32, height: u32) -> DistortionModel {
        DistortionModel::new(DistortionParameters::for_image(width, height)).unwrap()
    }

    #[test]
    fn test_identity_model_returns_input() {
        let image = gradient(16, 12, 1);
        let out = remove_distortion(&identity(16, 12), &image, &UndistortOptions::default()).unwrap();
        assert_relative_eq!(out.lower_left, Vector2::new(0.0, 0.0), epsilon = 1e-9);
        assert_relative_eq!(out.upper_right, Vector2::new(15.0, 11.0), epsilon = 1e-9);
        assert_eq!(out.image.width(), 16);
        assert_eq!(out.image.height(), 12);
        for (a, b) in out.image.data().iter().zip(image.data()) {
            assert_relative_eq!(a, b, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_channels_preserved() {
        let image = gradient(9, 7, 3);
        let model = DistortionModel::new(
            DistortionParameters::for_image(9, 7).with_radial(vec![-0.1]),
        )
        .unwrap();
        let out = remove_distortion(&model, &image, &UndistortOptions::default()).unwrap();
        assert_eq!(out.image.channels(), 3);
    }

    #[test]
    fn test_single_row_image() {
        let image = gradient(10, 1, 1);
        let out = remove_distortion(&identity(10, 1), &image, &UndistortOptions::default()).unwrap();
        assert_eq!(out.image.height(), 1);
        assert_eq!(out.image.width(), 10);
        assert_relative_eq!(out.image.pixel(4, 0)[0], 12.0, epsilon = 1e-9);
    }

    #[test]
    fn test_reshaped_canvas_spans_distorted_corners() {
        let params = DistortionParameters::new(200.0, 200.0, 50.0, 40.0).with_radial(vec![0.2]);
        let model = DistortionModel::new(params).unwrap();
        let image = gradient(100, 80, 1);
        let out = remove_distortion(&model, &image, &UndistortOptions::default()).unwrap();

        let ll = model.distort_point(&Vector2::new(0.0, 0.0));
        let ur = model.distort_point(&Vector2::new(99.0, 79.0));
        assert_eq!(out.lower_left, ll);
        assert_eq!(out.upper_right, ur);
        assert_eq!(out.image.width(), ((ur.x - ll.x) + 1e-9).floor() as usize + 1);
        assert_eq!(out.image.height(), ((ur.y - ll.y) + 1e-9).floor() as usize + 1);
        assert!(out.image.width() > 100);
    }

    #[test]
    fn test_boundary_modes() {
        let image = Raster::filled(40, 30, 1, 1.0).unwrap();
        let model = DistortionModel::new(
            DistortionParameters::new(40.0, 40.0, 20.0, 15.0).with_radial(vec![-0.3]),
        )
        .unwrap();

        let constant = UndistortOptions {
            reshape: false,
            boundary: BoundaryMode::Constant(0.0),
        };
        let out = remove_distortion(&model, &image, &constant).unwrap();
        assert_eq!(out.image.pixel(0, 0)[0], 0.0);
        assert_relative_eq!(out.image.pixel(20, 15)[0], 1.0, epsilon = 1e-12);

        let clamp = UndistortOptions {
            reshape: false,
            boundary: BoundaryMode::Clamp,
        };
        let out = remove_distortion(&model, &image, &clamp).unwrap();
        assert_relative_eq!(out.image.pixel(0, 0)[0], 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_degenerate_canvas() {
        let model = DistortionModel::new(
            DistortionParameters::new(1000.0, 1000.0, 320.0, 240.0).with_radial(vec![-50.0]),
        )
        .unwrap();
        let image = Raster::filled(640, 480, 1, 0.0).unwrap();
        let err = remove_distortion(&model, &image, &UndistortOptions::default()).unwrap_err();
        assert!(matches!(err, DistortionError::DegenerateCanvas { .. }));
    }

    #[test]
    fn test_cancelled_before_first_row() {
        let token = CancellationToken::new();
        token.cancel();
        let image = gradient(8, 8, 1);
        let err = remove_distortion_with_cancel(&identity(8, 8), &image, &UndistortOptions::default(), &token)
            .unwrap_err();
        assert_eq!(err, DistortionError::Cancelled);
    }

    #[test]
    fn test_bilinear_midpoint() {
        let image = Raster::from_rows(&[vec![0.0, 10.0], vec![20.0, 30.0]]).unwrap();
        let mut out = [0.0];
        bilinear_sample(&image, 0.5, 0.5, BoundaryMode::default(), &mut out);
        assert_relative_eq!(out[0], 15.0);
        bilinear_sample(&image, 1.0 + 1e-7, 0.0, BoundaryMode::default(), &mut out);
        assert_relative_eq!(out[0], 10.0);
        bilinear_sample(&image, 1.1, 0.0, BoundaryMode::Constant(-1.0), &mut out);
        assert_eq!(out[0], -1.0);
    }

    #[test]
    fn test_options_from_yaml() {
        let options: UndistortOptions = serde_yaml::from_str("boundary: !constant 128.0\n").unwrap();
        assert!(options.reshape);
        assert_eq!(options.boundary, BoundaryMode::Constant(128.0));
    }
}
