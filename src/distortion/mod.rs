//! Lens distortion models.
//!
//! A [`DistortionModel`] owns one immutable [`DistortionParameters`] value and
//! the kernel built from it. Kernels implement the [`DistortionKernel`] trait,
//! which maps single points between ideal (undistorted) and observed
//! (distorted) pixel coordinates. The concrete kernel is selected through the
//! tagged [`ModelKind`]:
//!
//! - [`ModelKind::Caltech`]: radial, tangential and skew terms ([`CaltechKernel`]).
//! - [`ModelKind::Radial`]: radial terms only ([`RadialKernel`]).
//!
//! Changing any parameter means building a new model with
//! [`DistortionModel::with_parameters`]; the kernel and the parameters it was
//! derived from can never disagree.

use nalgebra::{Matrix2xX, Vector2};
use serde::{Deserialize, Serialize};

pub mod caltech;
pub mod params;
pub mod radial;

pub use caltech::CaltechKernel;
pub use params::DistortionParameters;
pub use radial::RadialKernel;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DistortionError {
    #[error("Invalid distortion parameters: {0}")]
    InvalidParameters(String),
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),
    #[error("Degenerate output canvas: lower-left {lower_left:?}, upper-right {upper_right:?}")]
    DegenerateCanvas {
        lower_left: (f64, f64),
        upper_right: (f64, f64),
    },
    #[error("Line fit did not converge: {0}")]
    LineFitDidNotConverge(String),
    #[error("Insufficient constraints: {0}")]
    InsufficientConstraints(String),
    #[error("Calibration did not converge: {0}")]
    CalibrationDidNotConverge(String),
    #[error("Operation was cancelled")]
    Cancelled,
    #[error("Background job failed: {0}")]
    JobFailed(String),
}

impl DistortionError {
    /// `true` for numerical non-convergence, where retrying with more points,
    /// a better seed or relaxed tolerances can help. Everything else is an
    /// input or usage error.
    pub fn is_numerical(&self) -> bool {
        matches!(
            self,
            DistortionError::LineFitDidNotConverge(_)
                | DistortionError::CalibrationDidNotConverge(_)
        )
    }
}

/// Point-wise mapping between ideal and distorted pixel coordinates.
pub trait DistortionKernel {
    /// Maps an ideal (undistorted) pixel to its distorted location.
    fn distort(&self, point: &Vector2<f64>) -> Vector2<f64>;

    /// Maps a distorted pixel back to its ideal location.
    ///
    /// Usually solved iteratively, so `undistort(distort(p))` equals `p` only
    /// up to a small tolerance.
    fn undistort(&self, point: &Vector2<f64>) -> Vector2<f64>;
}

/// Selects which kernel a [`DistortionModel`] is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    /// Radial polynomial only. Tangential terms and skew must be zero.
    Radial,
    /// Caltech camera calibration toolbox model: radial, tangential and skew.
    #[default]
    Caltech,
}

#[derive(Debug, Clone, PartialEq)]
enum Kernel {
    Radial(RadialKernel),
    Caltech(CaltechKernel<f64>),
}

impl Kernel {
    fn build(kind: ModelKind, params: &DistortionParameters) -> Result<Self, DistortionError> {
        match kind {
            ModelKind::Radial => Ok(Kernel::Radial(RadialKernel::new(params)?)),
            ModelKind::Caltech => Ok(Kernel::Caltech(CaltechKernel::from_parameters(params))),
        }
    }
}

/// A distortion model: parameters plus the kernel derived from them.
///
/// # Examples
///
/// ```rust
/// use plumbline::distortion::{DistortionModel, DistortionParameters};
///
/// let params = DistortionParameters::new(1000.0, 1000.0, 320.0, 240.0)
///     .with_radial(vec![-0.2, 0.05]);
/// let model = DistortionModel::new(params).unwrap();
///
/// let (xs, ys) = model.distort(&[100.0, 500.0], &[80.0, 400.0]).unwrap();
/// let (ux, uy) = model.undistort(&xs, &ys).unwrap();
/// assert!((ux[0] - 100.0).abs() < 1e-3);
/// assert!((uy[1] - 400.0).abs() < 1e-3);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct DistortionModel {
    params: DistortionParameters,
    kind: ModelKind,
    kernel: Kernel,
}

impl DistortionModel {
    /// Builds a Caltech-kind model.
    pub fn new(params: DistortionParameters) -> Result<Self, DistortionError> {
        Self::with_kind(params, ModelKind::Caltech)
    }

    /// Builds a model of the given kind after validating the parameters.
    pub fn with_kind(params: DistortionParameters, kind: ModelKind) -> Result<Self, DistortionError> {
        params.validate()?;
        let kernel = Kernel::build(kind, &params)?;
        Ok(Self {
            params,
            kind,
            kernel,
        })
    }

    /// Returns a new model of the same kind built from `params`.
    pub fn with_parameters(&self, params: DistortionParameters) -> Result<Self, DistortionError> {
        Self::with_kind(params, self.kind)
    }

    pub fn parameters(&self) -> &DistortionParameters {
        &self.params
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    /// Distortion center in pixels.
    pub fn center(&self) -> Vector2<f64> {
        Vector2::new(self.params.center_x, self.params.center_y)
    }

    /// Maps arrays of ideal coordinates to distorted coordinates.
    ///
    /// # Errors
    ///
    /// [`DistortionError::ShapeMismatch`] if `xs` and `ys` differ in length.
    pub fn distort(&self, xs: &[f64], ys: &[f64]) -> Result<(Vec<f64>, Vec<f64>), DistortionError> {
        self.map_arrays(xs, ys, |p| self.distort_point(p))
    }

    /// Maps arrays of distorted coordinates back to ideal coordinates.
    ///
    /// # Errors
    ///
    /// [`DistortionError::ShapeMismatch`] if `xs` and `ys` differ in length.
    pub fn undistort(
        &self,
        xs: &[f64],
        ys: &[f64],
    ) -> Result<(Vec<f64>, Vec<f64>), DistortionError> {
        self.map_arrays(xs, ys, |p| self.undistort_point(p))
    }

    pub fn distort_point(&self, point: &Vector2<f64>) -> Vector2<f64> {
        DistortionKernel::distort(self, point)
    }

    pub fn undistort_point(&self, point: &Vector2<f64>) -> Vector2<f64> {
        DistortionKernel::undistort(self, point)
    }

    /// Column-wise [`DistortionModel::distort_point`] over a 2×N matrix.
    pub fn distort_points(&self, points: &Matrix2xX<f64>) -> Matrix2xX<f64> {
        let mut out = Matrix2xX::zeros(points.ncols());
        for (i, column) in points.column_iter().enumerate() {
            out.set_column(i, &self.distort_point(&column.into_owned()));
        }
        out
    }

    /// Column-wise [`DistortionModel::undistort_point`] over a 2×N matrix.
    pub fn undistort_points(&self, points: &Matrix2xX<f64>) -> Matrix2xX<f64> {
        let mut out = Matrix2xX::zeros(points.ncols());
        for (i, column) in points.column_iter().enumerate() {
            out.set_column(i, &self.undistort_point(&column.into_owned()));
        }
        out
    }

    fn map_arrays<F>(
        &self,
        xs: &[f64],
        ys: &[f64],
        f: F,
    ) -> Result<(Vec<f64>, Vec<f64>), DistortionError>
    where
        F: Fn(&Vector2<f64>) -> Vector2<f64>,
    {
        if xs.len() != ys.len() {
            return Err(DistortionError::ShapeMismatch(format!(
                "x array has {} elements, y array has {}",
                xs.len(),
                ys.len()
            )));
        }
        let (out_x, out_y) = xs
            .iter()
            .zip(ys)
            .map(|(&x, &y)| {
                let p = f(&Vector2::new(x, y));
                (p.x, p.y)
            })
            .unzip();
        Ok((out_x, out_y))
    }
}

impl DistortionKernel for DistortionModel {
    fn distort(&self, point: &Vector2<f64>) -> Vector2<f64> {
        match &self.kernel {
            Kernel::Radial(k) => k.distort(point),
            Kernel::Caltech(k) => DistortionKernel::distort(k, point),
        }
    }

    fn undistort(&self, point: &Vector2<f64>) -> Vector2<f64> {
        match &self.kernel {
            Kernel::Radial(k) => k.undistort(point),
            Kernel::Caltech(k) => DistortionKernel::undistort(k, point),
        }
    }
}

/// Common validation functions for distortion parameters
pub mod validation {
    use super::*;

    pub fn validate_focal_lengths(fx: f64, fy: f64) -> Result<(), DistortionError> {
        if !(fx.is_finite() && fy.is_finite()) || fx <= 0.0 || fy <= 0.0 {
            return Err(DistortionError::InvalidParameters(format!(
                "focal lengths must be positive and finite, got fx={fx}, fy={fy}"
            )));
        }
        Ok(())
    }

    pub fn validate_finite(name: &str, value: f64) -> Result<(), DistortionError> {
        if !value.is_finite() {
            return Err(DistortionError::InvalidParameters(format!(
                "{name} must be finite, got {value}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample_params() -> DistortionParameters {
        DistortionParameters::new(1000.0, 980.0, 321.0, 242.0)
            .with_radial(vec![-0.25, 0.08])
            .with_tangential(1e-3, -5e-4)
            .with_skew(1e-3)
    }

    fn working_grid() -> Vec<Vector2<f64>> {
        let mut points = Vec::new();
        for i in 0..=8 {
            for j in 0..=6 {
                points.push(Vector2::new(i as f64 * 80.0, j as f64 * 80.0));
            }
        }
        points
    }

    #[test]
    fn test_rejects_non_positive_focal_length() {
        let params = DistortionParameters::new(0.0, 1000.0, 320.0, 240.0);
        let err = DistortionModel::new(params).unwrap_err();
        assert!(matches!(err, DistortionError::InvalidParameters(_)));

        let params = DistortionParameters::new(1000.0, -1.0, 320.0, 240.0);
        assert!(DistortionModel::new(params).is_err());
    }

    #[test]
    fn test_shape_mismatch() {
        let model = DistortionModel::new(sample_params()).unwrap();
        let err = model.distort(&[1.0, 2.0], &[1.0]).unwrap_err();
        assert!(matches!(err, DistortionError::ShapeMismatch(_)));
        let err = model.undistort(&[1.0], &[]).unwrap_err();
        assert!(matches!(err, DistortionError::ShapeMismatch(_)));
    }

    #[test]
    fn test_round_trip_within_tolerance() {
        let model = DistortionModel::new(sample_params()).unwrap();
        for p in working_grid() {
            let there = model.undistort_point(&model.distort_point(&p));
            assert!((there - p).norm() < 1e-3, "distort/undistort drift at {p:?}");
            let back = model.distort_point(&model.undistort_point(&p));
            assert!((back - p).norm() < 1e-3, "undistort/distort drift at {p:?}");
        }
    }

    #[test]
    fn test_zero_distortion_is_identity() {
        for kind in [ModelKind::Caltech, ModelKind::Radial] {
            let params = DistortionParameters::new(800.0, 800.0, 300.0, 200.0);
            let model = DistortionModel::with_kind(params, kind).unwrap();
            for p in working_grid() {
                let d = model.distort_point(&p);
                assert_relative_eq!(d.x, p.x, epsilon = 1e-9);
                assert_relative_eq!(d.y, p.y, epsilon = 1e-9);
                let u = model.undistort_point(&d);
                assert_relative_eq!(u.x, p.x, epsilon = 1e-9);
                assert_relative_eq!(u.y, p.y, epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn test_center_is_fixed_point() {
        let model = DistortionModel::new(sample_params()).unwrap();
        let c = model.center();
        assert_relative_eq!(model.distort_point(&c), c, epsilon = 1e-9);
        assert_relative_eq!(model.undistort_point(&c), c, epsilon = 1e-9);
    }

    #[test]
    fn test_radial_kind_matches_caltech_without_tangential_terms() {
        let params = DistortionParameters::new(1000.0, 1000.0, 320.0, 240.0)
            .with_radial(vec![-0.2, 0.05]);
        let caltech = DistortionModel::new(params.clone()).unwrap();
        let radial = DistortionModel::with_kind(params, ModelKind::Radial).unwrap();
        for p in working_grid() {
            assert_relative_eq!(caltech.distort_point(&p), radial.distort_point(&p), epsilon = 1e-9);
            assert_relative_eq!(
                caltech.undistort_point(&p),
                radial.undistort_point(&p),
                epsilon = 1e-6
            );
        }
    }

    #[test]
    fn test_radial_kind_rejects_tangential_terms() {
        let params = sample_params();
        let err = DistortionModel::with_kind(params, ModelKind::Radial).unwrap_err();
        assert!(matches!(err, DistortionError::InvalidParameters(_)));
    }

    #[test]
    fn test_with_parameters_rebuilds_kernel() {
        let model = DistortionModel::new(sample_params()).unwrap();
        let p = Vector2::new(600.0, 420.0);
        let before = model.distort_point(&p);

        let updated = model
            .with_parameters(model.parameters().clone().with_radial(vec![0.0, 0.0]))
            .unwrap();
        assert_eq!(updated.kind(), model.kind());
        assert_ne!(updated.distort_point(&p), before);
        // the original value is untouched
        assert_eq!(model.distort_point(&p), before);
    }

    #[test]
    fn test_matrix_forms_match_arrays() {
        let model = DistortionModel::new(sample_params()).unwrap();
        let points = Matrix2xX::from_columns(&working_grid());
        let distorted = model.distort_points(&points);
        let xs: Vec<f64> = points.row(0).iter().copied().collect();
        let ys: Vec<f64> = points.row(1).iter().copied().collect();
        let (dx, dy) = model.distort(&xs, &ys).unwrap();
        for i in 0..points.ncols() {
            assert_eq!(distorted[(0, i)], dx[i]);
            assert_eq!(distorted[(1, i)], dy[i]);
        }
        let restored = model.undistort_points(&distorted);
        assert!((restored - points).abs().max() < 1e-3);
    }

    #[test]
    fn test_error_classification() {
        assert!(DistortionError::CalibrationDidNotConverge("x".into()).is_numerical());
        assert!(DistortionError::LineFitDidNotConverge("x".into()).is_numerical());
        assert!(!DistortionError::ShapeMismatch("x".into()).is_numerical());
        assert!(!DistortionError::InsufficientConstraints("x".into()).is_numerical());
    }
}
