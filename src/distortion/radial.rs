//! Radial-only distortion.
//!
//! Same forward mapping as the Caltech model with the tangential terms and
//! skew removed. Because the distortion only rescales the radius, the inverse
//! reduces to a one-dimensional root finding problem, solved with Newton's
//! method on `r * (1 + k1 r^2 + k2 r^4 + ...) = r_d`.

use super::{DistortionError, DistortionKernel, DistortionParameters};
use nalgebra::Vector2;

const MAX_NEWTON_ITERATIONS: usize = 50;
const NEWTON_TOLERANCE: f64 = 1e-15;

#[derive(Debug, Clone, PartialEq)]
pub struct RadialKernel {
    focal: Vector2<f64>,
    center: Vector2<f64>,
    radial: Vec<f64>,
}

impl RadialKernel {
    /// # Errors
    ///
    /// [`DistortionError::InvalidParameters`] if the parameters carry
    /// tangential terms or skew, which this kernel cannot represent.
    pub fn new(params: &DistortionParameters) -> Result<Self, DistortionError> {
        if params.tangential != [0.0; 2] || params.skew != 0.0 {
            return Err(DistortionError::InvalidParameters(format!(
                "radial model cannot represent tangential terms {:?} or skew {}",
                params.tangential, params.skew
            )));
        }
        Ok(Self {
            focal: Vector2::new(params.focal_length_x, params.focal_length_y),
            center: Vector2::new(params.center_x, params.center_y),
            radial: params.radial.clone(),
        })
    }

    fn factor(&self, r2: f64) -> f64 {
        self.radial
            .iter()
            .rev()
            .fold(0.0, |acc, k| (acc + k) * r2)
            + 1.0
    }

    /// d/dr of `r * factor(r^2)`.
    fn factor_derivative(&self, r2: f64) -> f64 {
        let mut derivative = 1.0;
        let mut power = 1.0;
        for (i, k) in self.radial.iter().enumerate() {
            power *= r2;
            derivative += (2 * i + 3) as f64 * k * power;
        }
        derivative
    }

    fn normalize(&self, point: &Vector2<f64>) -> Vector2<f64> {
        (point - self.center).component_div(&self.focal)
    }

    fn to_pixel(&self, point: &Vector2<f64>) -> Vector2<f64> {
        point.component_mul(&self.focal) + self.center
    }
}

impl DistortionKernel for RadialKernel {
    fn distort(&self, point: &Vector2<f64>) -> Vector2<f64> {
        let n = self.normalize(point);
        self.to_pixel(&(n * self.factor(n.norm_squared())))
    }

    fn undistort(&self, point: &Vector2<f64>) -> Vector2<f64> {
        let n = self.normalize(point);
        let r_d = n.norm();
        if r_d == 0.0 || self.radial.is_empty() {
            return *point;
        }

        let mut r = r_d;
        for _ in 0..MAX_NEWTON_ITERATIONS {
            let r2 = r * r;
            let g = r * self.factor(r2) - r_d;
            let dg = self.factor_derivative(r2);
            if !dg.is_finite() || dg.abs() < f64::EPSILON {
                break;
            }
            let step = g / dg;
            r -= step;
            if step.abs() < NEWTON_TOLERANCE {
                break;
            }
        }
        self.to_pixel(&(n * (r / r_d)))
    }
}
