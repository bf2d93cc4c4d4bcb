//! Caltech camera calibration toolbox distortion model.
//!
//! Pixel coordinates are normalised with the focal lengths, center and skew,
//!
//! ```text
//! yn = (v - cy) / fy
//! xn = (u - cx) / fx - skew * yn
//! ```
//!
//! and distorted with a radial polynomial plus two tangential terms:
//!
//! ```text
//! r2 = xn^2 + yn^2
//! radial = 1 + k1 r2 + k2 r2^2 + ...
//! xd = xn * radial + 2 p1 xn yn + p2 (r2 + 2 xn^2)
//! yd = yn * radial + p1 (r2 + 2 yn^2) + 2 p2 xn yn
//! ```
//!
//! The inverse has no closed form and is computed by fixed-point iteration.
//!
//! The kernel is generic over the scalar so that the calibration factors can
//! evaluate it on dual numbers and let the solver differentiate through the
//! inverse mapping.

use super::{DistortionKernel, DistortionParameters};
use nalgebra::{RealField, Vector2};

/// Number of fixed-point iterations used by [`CaltechKernel::undistort_xy`].
pub const UNDISTORT_ITERATIONS: usize = 20;

/// Radial + tangential + skew kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct CaltechKernel<T: RealField = f64> {
    pub fx: T,
    pub fy: T,
    pub cx: T,
    pub cy: T,
    pub radial: Vec<T>,
    pub p1: T,
    pub p2: T,
    pub skew: T,
}

impl CaltechKernel<f64> {
    pub fn from_parameters(params: &DistortionParameters) -> Self {
        Self {
            fx: params.focal_length_x,
            fy: params.focal_length_y,
            cx: params.center_x,
            cy: params.center_y,
            radial: params.radial.clone(),
            p1: params.tangential[0],
            p2: params.tangential[1],
            skew: params.skew,
        }
    }
}

impl<T: RealField> CaltechKernel<T> {
    fn radial_factor(&self, r2: T) -> T {
        let mut factor = T::one();
        let mut power = T::one();
        for k in &self.radial {
            power *= r2.clone();
            factor += k.clone() * power.clone();
        }
        factor
    }

    fn tangential(&self, x: T, y: T, r2: T) -> (T, T) {
        let two: T = nalgebra::convert(2.0);
        let dx = two.clone() * self.p1.clone() * x.clone() * y.clone()
            + self.p2.clone() * (r2.clone() + two.clone() * x.clone() * x.clone());
        let dy = self.p1.clone() * (r2 + two.clone() * y.clone() * y.clone())
            + two * self.p2.clone() * x * y;
        (dx, dy)
    }

    fn normalize(&self, u: T, v: T) -> (T, T) {
        let y = (v - self.cy.clone()) / self.fy.clone();
        let x = (u - self.cx.clone()) / self.fx.clone() - self.skew.clone() * y.clone();
        (x, y)
    }

    fn to_pixel(&self, x: T, y: T) -> (T, T) {
        let u = self.fx.clone() * (x + self.skew.clone() * y.clone()) + self.cx.clone();
        let v = self.fy.clone() * y + self.cy.clone();
        (u, v)
    }

    /// Ideal pixel `(u, v)` to distorted pixel.
    pub fn distort_xy(&self, u: T, v: T) -> (T, T) {
        let (x, y) = self.normalize(u, v);
        let r2 = x.clone() * x.clone() + y.clone() * y.clone();
        let radial = self.radial_factor(r2.clone());
        let (dx, dy) = self.tangential(x.clone(), y.clone(), r2);
        self.to_pixel(x * radial.clone() + dx, y * radial + dy)
    }

    /// Distorted pixel `(u, v)` to ideal pixel.
    pub fn undistort_xy(&self, u: T, v: T) -> (T, T) {
        let (xd, yd) = self.normalize(u, v);
        let (mut x, mut y) = (xd.clone(), yd.clone());
        for _ in 0..UNDISTORT_ITERATIONS {
            let r2 = x.clone() * x.clone() + y.clone() * y.clone();
            let radial = self.radial_factor(r2.clone());
            let (dx, dy) = self.tangential(x.clone(), y.clone(), r2);
            x = (xd.clone() - dx) / radial.clone();
            y = (yd.clone() - dy) / radial;
        }
        self.to_pixel(x, y)
    }
}

impl DistortionKernel for CaltechKernel<f64> {
    fn distort(&self, point: &Vector2<f64>) -> Vector2<f64> {
        let (u, v) = self.distort_xy(point.x, point.y);
        Vector2::new(u, v)
    }

    fn undistort(&self, point: &Vector2<f64>) -> Vector2<f64> {
        let (u, v) = self.undistort_xy(point.x, point.y);
        Vector2::new(u, v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_distort_matches_closed_form() {
        let params = DistortionParameters::new(500.0, 400.0, 100.0, 50.0)
            .with_radial(vec![0.1, -0.02])
            .with_tangential(0.01, 0.02)
            .with_skew(0.05);
        let kernel = CaltechKernel::from_parameters(&params);

        let (u, v) = (300.0, 250.0);
        let yn = (v - 50.0) / 400.0;
        let xn = (u - 100.0) / 500.0 - 0.05 * yn;
        let r2 = xn * xn + yn * yn;
        let radial = 1.0 + 0.1 * r2 - 0.02 * r2 * r2;
        let xd = xn * radial + 2.0 * 0.01 * xn * yn + 0.02 * (r2 + 2.0 * xn * xn);
        let yd = yn * radial + 0.01 * (r2 + 2.0 * yn * yn) + 2.0 * 0.02 * xn * yn;
        let expected = Vector2::new(500.0 * (xd + 0.05 * yd) + 100.0, 400.0 * yd + 50.0);

        assert_relative_eq!(kernel.distort(&Vector2::new(u, v)), expected, epsilon = 1e-9);
    }

    #[test]
    fn test_strong_pincushion_round_trip() {
        // strong pincushion term, inverse must still converge inside the working radius
        let params = DistortionParameters::new(1000.0, 1000.0, 321.0, 242.0).with_radial(vec![0.9]);
        let kernel = CaltechKernel::from_parameters(&params);
        for i in -3..=3 {
            for j in -3..=3 {
                let p = Vector2::new(321.0 + i as f64 * 70.0, 242.0 + j as f64 * 70.0);
                let back = kernel.undistort(&kernel.distort(&p));
                assert!((back - p).norm() < 1e-3, "round trip drift at {p:?}: {back:?}");
            }
        }
    }

    #[test]
    fn test_generic_evaluation_matches_f64() {
        let params = DistortionParameters::new(1000.0, 1000.0, 320.0, 240.0).with_radial(vec![-0.2, 0.05]);
        let kernel = CaltechKernel::from_parameters(&params);
        let kernel32 = CaltechKernel::<f32> {
            fx: 1000.0,
            fy: 1000.0,
            cx: 320.0,
            cy: 240.0,
            radial: vec![-0.2, 0.05],
            p1: 0.0,
            p2: 0.0,
            skew: 0.0,
        };
        let (ua, va) = kernel.undistort_xy(600.0, 100.0);
        let (ub, vb) = kernel32.undistort_xy(600.0, 100.0);
        assert!((ua - ub as f64).abs() < 1e-2);
        assert!((va - vb as f64).abs() < 1e-2);
    }
}
