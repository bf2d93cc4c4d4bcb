//! Straight-line primitives used by the plumb-line estimator.
//!
//! Lines are kept in normal form `x·cos(θ) + y·sin(θ) = offset`. The same line
//! has two representations, `(θ, offset)` and `(θ + π, -offset)`, and `θ` is
//! only defined modulo `2π`; [`LineFit::same_line`] compares lines accordingly.

use crate::distortion::DistortionError;
use crate::optimization::levenberg::{minimize, StopRule, Termination};
use log::debug;
use nalgebra::{DVector, Matrix2, RealField, Vector2};
use serde::{Deserialize, Serialize};
use tiny_solver::factors::Factor;

const LINE: &str = "line";

const LINE_FIT_STOP_RULE: StopRule = StopRule {
    max_iterations: 500,
    relative_decrease: 1e-12,
    absolute_decrease: 1e-14,
    min_cost: 1e-20,
};

/// Points asserted to be collinear once distortion is removed.
pub type LineGroup = Vec<Vector2<f64>>;

/// A line in normal form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LineFit {
    pub theta: f64,
    pub offset: f64,
}

impl LineFit {
    pub fn new(theta: f64, offset: f64) -> Self {
        Self { theta, offset }
    }

    /// Signed perpendicular distance of `point` from the line.
    pub fn distance(&self, point: &Vector2<f64>) -> f64 {
        point_line_distance(self.theta, self.offset, point.x, point.y)
    }

    pub fn distances(&self, points: &[Vector2<f64>]) -> Vec<f64> {
        points.iter().map(|p| self.distance(p)).collect()
    }

    /// Unit normal `(cos θ, sin θ)`.
    pub fn normal(&self) -> Vector2<f64> {
        Vector2::new(self.theta.cos(), self.theta.sin())
    }

    /// `true` when both fits describe the same geometric line, regardless of
    /// which of the two normal-form representations each one uses.
    pub fn same_line(&self, other: &LineFit, tolerance: f64) -> bool {
        let alignment = self.normal().dot(&other.normal());
        let sign = alignment.signum();
        (alignment.abs() - 1.0).abs() < tolerance
            && (self.offset - sign * other.offset).abs() < tolerance
    }
}

/// Perpendicular distance `x·cos(θ) + y·sin(θ) - offset`, generic so the
/// calibration factors can evaluate it on dual numbers.
pub fn point_line_distance<T: RealField>(theta: T, offset: T, x: T, y: T) -> T {
    x * theta.clone().cos() + y * theta.sin() - offset
}

/// Starting point of the line fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineSeed {
    /// `theta = 1`, `offset = 1`, independent of the data.
    #[default]
    Fixed,
    /// Line through the centroid along the principal direction of the points.
    PrincipalAxis,
}

impl LineSeed {
    fn initial_guess(&self, points: &[Vector2<f64>]) -> LineFit {
        match self {
            LineSeed::Fixed => LineFit::new(1.0, 1.0),
            LineSeed::PrincipalAxis => principal_axis_line(points),
        }
    }
}

/// Closed-form total least squares line: the normal is the eigenvector of the
/// scatter matrix with the smallest eigenvalue.
pub fn principal_axis_line(points: &[Vector2<f64>]) -> LineFit {
    let n = points.len().max(1) as f64;
    let centroid = points.iter().fold(Vector2::zeros(), |acc, p| acc + p) / n;
    let scatter = points.iter().fold(Matrix2::zeros(), |acc, p| {
        let d = p - centroid;
        acc + d * d.transpose()
    });
    let eigen = scatter.symmetric_eigen();
    let smallest = eigen.eigenvalues.imin();
    let normal = eigen.eigenvectors.column(smallest).into_owned();
    let theta = normal.y.atan2(normal.x);
    LineFit::new(theta, centroid.dot(&normal))
}

#[derive(Debug, Clone)]
struct LineFitCost {
    points: Vec<Vector2<f64>>,
}

impl<T: RealField> Factor<T> for LineFitCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let line = &params[0];
        DVector::from_iterator(
            self.points.len(),
            self.points.iter().map(|p| {
                point_line_distance(
                    line[0].clone(),
                    line[1].clone(),
                    nalgebra::convert(p.x),
                    nalgebra::convert(p.y),
                )
            }),
        )
    }
}

/// Fits a line to `points` from the fixed seed `theta = 1, offset = 1`.
///
/// # Errors
///
/// [`DistortionError::LineFitDidNotConverge`] for fewer than two points,
/// coincident points, or when the solver fails.
pub fn fit_line(points: &[Vector2<f64>]) -> Result<LineFit, DistortionError> {
    fit_line_with_seed(points, LineSeed::Fixed)
}

/// Least squares line fit by Levenberg-Marquardt on the perpendicular
/// distances, starting from `seed`.
///
/// The result is checked against the closed-form total least squares line, so
/// a run that stops short of the optimum is reported instead of returned.
pub fn fit_line_with_seed(points: &[Vector2<f64>], seed: LineSeed) -> Result<LineFit, DistortionError> {
    if points.len() < 2 {
        return Err(DistortionError::LineFitDidNotConverge(format!(
            "need at least 2 points, got {}",
            points.len()
        )));
    }
    let first = points[0];
    let spread = points
        .iter()
        .map(|p| (p - first).norm())
        .fold(0.0, f64::max);
    if spread <= f64::EPSILON * first.norm().max(1.0) {
        return Err(DistortionError::LineFitDidNotConverge(format!(
            "all {} points coincide at {:?}",
            points.len(),
            first
        )));
    }

    let guess = seed.initial_guess(points);

    let mut problem = tiny_solver::Problem::new();
    problem.add_residual_block(
        points.len(),
        &[LINE],
        Box::new(LineFitCost {
            points: points.to_vec(),
        }),
        None,
    );

    let cost = |line: &DVector<f64>| {
        points
            .iter()
            .map(|p| point_line_distance(line[0], line[1], p.x, p.y).powi(2))
            .sum::<f64>()
    };
    let run = minimize(
        &problem,
        LINE,
        DVector::from_vec(vec![guess.theta, guess.offset]),
        &cost,
        &LINE_FIT_STOP_RULE,
        None,
    )?;
    if run.termination == Termination::NonFinite {
        return Err(DistortionError::LineFitDidNotConverge(format!(
            "non-finite distances at {:?} for {} points",
            guess,
            points.len()
        )));
    }

    // The principal axis line is the exact least squares optimum.
    let optimum = principal_axis_line(points);
    let optimum_cost = cost(&DVector::from_vec(vec![optimum.theta, optimum.offset]));
    let scale = points.iter().map(|p| p.norm_squared()).fold(1.0, f64::max);
    if !(run.final_cost <= optimum_cost * (1.0 + 1e-6) + 1e-18 * scale * points.len() as f64) {
        return Err(DistortionError::LineFitDidNotConverge(format!(
            "{} after {} iterations on {} points starting from {:?}: cost {:.6e}, least squares optimum {:.6e}",
            run.termination,
            run.iterations,
            points.len(),
            guess,
            run.final_cost,
            optimum_cost
        )));
    }

    let fit = LineFit::new(run.params[0], run.params[1]);
    debug!(
        "Fitted line {:?} to {} points in {} iterations",
        fit,
        points.len(),
        run.iterations
    );
    Ok(fit)
}
