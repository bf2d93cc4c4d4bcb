//! The `optimization` module estimates distortion parameters from points that
//! are known to lie on straight lines in the scene.
//!
//! After the correct distortion is removed, every marked group of points must
//! be collinear. [`CalibrationObjective`] turns that statement into a residual
//! vector over the packed parameter vector
//!
//! ```text
//! [center_x, center_y, k1, k2, theta_1, offset_1, theta_2, offset_2, ...]
//! ```
//!
//! where each line group contributes its own normal-form line. The
//! [`plumb_line`] submodule minimizes the residuals with tiny-solver's
//! Levenberg-Marquardt step under a damping loop of its own and turns the
//! solution back into a [`DistortionModel`].
//!
//! The method follows Prescott and McLean, "Line-Based Correction of Radial
//! Lens Distortion" (GMIP 1997).

use crate::distortion::{
    validation, CaltechKernel, DistortionError, DistortionModel, DistortionParameters, ModelKind,
};
use crate::geometry::{fit_line_with_seed, point_line_distance, LineFit, LineGroup, LineSeed};
use log::warn;
use nalgebra::{DVector, RealField, Vector2};

pub(crate) mod levenberg;
pub mod plumb_line;

pub use plumb_line::{
    calibrate, calibrate_with_cancel, Calibration, CalibrationReport, LineCalibration, Optimizer,
    SolverOptions,
};

/// Number of model parameters that precede the per-line parameters.
pub const MODEL_PARAMETER_COUNT: usize = 4;

/// Soft constraint pulling the estimated distortion center towards a guess.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CenterPrior {
    /// Guessed center in distorted image coordinates.
    pub center: Vector2<f64>,
    /// Weight of the distance between the estimated and guessed center.
    pub penalty: f64,
}

/// Residual functions of the plumb-line estimator.
///
/// The objective is a pure function of the parameter vector and the inputs it
/// was built with, so it can be evaluated concurrently.
#[derive(Debug, Clone)]
pub struct CalibrationObjective {
    lines: Vec<LineGroup>,
    focal_length_x: f64,
    focal_length_y: f64,
    tangential: [f64; 2],
    skew: f64,
    kind: ModelKind,
    center_prior: Option<CenterPrior>,
    line_seed: LineSeed,
}

impl CalibrationObjective {
    /// Creates an objective over `lines`, given in distorted image coordinates.
    ///
    /// Groups with fewer than two points cannot define a line and are dropped.
    pub fn new(lines: Vec<LineGroup>, focal_length_x: f64, focal_length_y: f64) -> Self {
        let total = lines.len();
        let lines: Vec<LineGroup> = lines
            .into_iter()
            .enumerate()
            .filter_map(|(i, line)| {
                if line.len() < 2 {
                    warn!("Ignoring line group {} with {} point(s)", i, line.len());
                    None
                } else {
                    Some(line)
                }
            })
            .collect();
        if lines.len() < total {
            warn!("Using {} of {} line groups", lines.len(), total);
        }
        Self {
            lines,
            focal_length_x,
            focal_length_y,
            tangential: [0.0; 2],
            skew: 0.0,
            kind: ModelKind::Caltech,
            center_prior: None,
            line_seed: LineSeed::Fixed,
        }
    }

    /// Creates an objective that keeps the focal lengths, tangential terms,
    /// skew and kind of `model` fixed.
    pub fn from_model(lines: Vec<LineGroup>, model: &DistortionModel) -> Self {
        let params = model.parameters();
        let mut objective = Self::new(lines, params.focal_length_x, params.focal_length_y);
        objective.tangential = params.tangential;
        objective.skew = params.skew;
        objective.kind = model.kind();
        objective
    }

    /// Adds a center prior with the default penalty coefficient of 1.
    pub fn with_center_prior(self, center: Vector2<f64>) -> Self {
        self.with_weighted_center_prior(center, 1.0)
    }

    pub fn with_weighted_center_prior(mut self, center: Vector2<f64>, penalty: f64) -> Self {
        self.center_prior = Some(CenterPrior { center, penalty });
        self
    }

    pub fn with_tangential(mut self, p1: f64, p2: f64) -> Self {
        self.tangential = [p1, p2];
        self
    }

    pub fn with_skew(mut self, skew: f64) -> Self {
        self.skew = skew;
        self
    }

    pub fn with_line_seed(mut self, seed: LineSeed) -> Self {
        self.line_seed = seed;
        self
    }

    pub fn lines(&self) -> &[LineGroup] {
        &self.lines
    }

    pub fn center_prior(&self) -> Option<&CenterPrior> {
        self.center_prior.as_ref()
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    pub fn point_count(&self) -> usize {
        self.lines.iter().map(Vec::len).sum()
    }

    /// Length of the packed parameter vector.
    pub fn parameter_count(&self) -> usize {
        MODEL_PARAMETER_COUNT + 2 * self.lines.len()
    }

    /// Checks that the objective can be handed to a solver.
    ///
    /// # Errors
    ///
    /// * [`DistortionError::InsufficientConstraints`] if no usable line group is left.
    /// * [`DistortionError::InvalidParameters`] for invalid fixed terms.
    pub fn validate(&self) -> Result<(), DistortionError> {
        if self.lines.is_empty() {
            return Err(DistortionError::InsufficientConstraints(
                "no line group with at least 2 points".to_string(),
            ));
        }
        validation::validate_focal_lengths(self.focal_length_x, self.focal_length_y)?;
        if let Some(prior) = &self.center_prior {
            if !(prior.center.x.is_finite() && prior.center.y.is_finite())
                || !prior.penalty.is_finite()
                || prior.penalty < 0.0
            {
                return Err(DistortionError::InvalidParameters(format!(
                    "invalid center prior {prior:?}"
                )));
            }
        }
        if self.point_count() < self.parameter_count() {
            warn!(
                "{} points constrain {} parameters, the estimate is underdetermined",
                self.point_count(),
                self.parameter_count()
            );
        }
        Ok(())
    }

    /// Initial parameter vector: center and first two radial terms of
    /// `seed_model`, then one line fitted to the raw distorted points of each
    /// group.
    pub fn initial_parameters(&self, seed_model: &DistortionModel) -> Result<DVector<f64>, DistortionError> {
        let seed = seed_model.parameters();
        let mut params = Vec::with_capacity(self.parameter_count());
        params.extend([seed.center_x, seed.center_y, seed.k1(), seed.k2()]);
        for line in &self.lines {
            let fit = fit_line_with_seed(line, self.line_seed)?;
            params.extend([fit.theta, fit.offset]);
        }
        Ok(DVector::from_vec(params))
    }

    /// Distances of the undistorted points of every group from that group's
    /// line, concatenated in group order.
    pub fn residuals(&self, params: &DVector<f64>) -> Result<DVector<f64>, DistortionError> {
        self.check_length(params)?;
        Ok(self.line_residuals(params))
    }

    /// [`CalibrationObjective::residuals`] followed by
    /// `penalty * |center - prior|` when a center prior is set.
    pub fn penalized_residuals(&self, params: &DVector<f64>) -> Result<DVector<f64>, DistortionError> {
        let residuals = self.residuals(params)?;
        match &self.center_prior {
            Some(prior) => {
                let drift = (Vector2::new(params[0], params[1]) - prior.center).norm();
                let n = residuals.len();
                let mut penalized = residuals.resize_vertically(n + 1, 0.0);
                penalized[n] = prior.penalty * drift;
                Ok(penalized)
            }
            None => Ok(residuals),
        }
    }

    /// Sum of squared [`CalibrationObjective::residuals`], for reporting.
    pub fn sum_of_squares(&self, params: &DVector<f64>) -> Result<f64, DistortionError> {
        Ok(self.residuals(params)?.norm_squared())
    }

    /// Distortion model described by the first four entries of `params`.
    pub fn model_for(&self, params: &DVector<f64>) -> Result<DistortionModel, DistortionError> {
        self.check_length(params)?;
        let parameters = DistortionParameters::new(
            self.focal_length_x,
            self.focal_length_y,
            params[0],
            params[1],
        )
        .with_radial(vec![params[2], params[3]])
        .with_tangential(self.tangential[0], self.tangential[1])
        .with_skew(self.skew);
        DistortionModel::with_kind(parameters, self.kind)
    }

    /// Per-group lines stored in `params`.
    pub fn lines_for(&self, params: &DVector<f64>) -> Result<Vec<LineFit>, DistortionError> {
        self.check_length(params)?;
        Ok((0..self.lines.len())
            .map(|i| {
                let base = MODEL_PARAMETER_COUNT + 2 * i;
                LineFit::new(params[base], params[base + 1])
            })
            .collect())
    }

    fn check_length(&self, params: &DVector<f64>) -> Result<(), DistortionError> {
        if params.len() != self.parameter_count() {
            return Err(DistortionError::ShapeMismatch(format!(
                "expected {} parameters for {} line groups, got {}",
                self.parameter_count(),
                self.lines.len(),
                params.len()
            )));
        }
        Ok(())
    }

    /// Kernel for the candidate parameters. Radial-only models share the
    /// Caltech forward mapping, so one generic kernel serves both kinds.
    fn kernel_for<T: RealField>(&self, params: &DVector<T>) -> CaltechKernel<T> {
        CaltechKernel {
            fx: nalgebra::convert(self.focal_length_x),
            fy: nalgebra::convert(self.focal_length_y),
            cx: params[0].clone(),
            cy: params[1].clone(),
            radial: vec![params[2].clone(), params[3].clone()],
            p1: nalgebra::convert(self.tangential[0]),
            p2: nalgebra::convert(self.tangential[1]),
            skew: nalgebra::convert(self.skew),
        }
    }

    /// Residual core shared by the f64 evaluation and the solver factor.
    /// `params` must already have the right length.
    pub(crate) fn line_residuals<T: RealField>(&self, params: &DVector<T>) -> DVector<T> {
        let kernel = self.kernel_for(params);
        let mut residuals = Vec::with_capacity(self.point_count());
        for (i, line) in self.lines.iter().enumerate() {
            let base = MODEL_PARAMETER_COUNT + 2 * i;
            let theta = &params[base];
            let offset = &params[base + 1];
            for point in line {
                let (u, v) = kernel.undistort_xy(nalgebra::convert(point.x), nalgebra::convert(point.y));
                residuals.push(point_line_distance(theta.clone(), offset.clone(), u, v));
            }
        }
        DVector::from_vec(residuals)
    }
}
