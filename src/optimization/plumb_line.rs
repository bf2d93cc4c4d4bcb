//! Levenberg-Marquardt driver for the plumb-line objective.
//!
//! The packed parameter vector of a [`CalibrationObjective`] is registered as
//! a single tiny-solver variable. The residual block is evaluated generically,
//! so derivatives through the iterative inverse mapping come from automatic
//! differentiation. A run that stops on the iteration budget, or never gets
//! below its initial cost, is an error rather than a result.

use super::levenberg::{minimize, Minimization, StopRule, Termination};
use super::CalibrationObjective;
use crate::distortion::{DistortionError, DistortionModel, DistortionParameters};
use crate::geometry::LineFit;
use crate::jobs::CancellationToken;

use log::{info, warn};
use nalgebra::{DVector, RealField};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tiny_solver::factors::Factor;

const PARAMS: &str = "params";

/// Residual block handed to tiny-solver.
///
/// The center prior is split into its x and y components here. The squared
/// norm of the pair equals the square of the single distance term of
/// [`CalibrationObjective::penalized_residuals`], but stays differentiable
/// when the center sits exactly on the prior.
#[derive(Debug, Clone)]
struct PlumbLineCost {
    objective: CalibrationObjective,
}

impl PlumbLineCost {
    fn residual_count(&self) -> usize {
        let prior = if self.objective.center_prior().is_some() { 2 } else { 0 };
        self.objective.point_count() + prior
    }
}

impl<T: RealField> Factor<T> for PlumbLineCost {
    fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
        let p = &params[0];
        let lines = self.objective.line_residuals(p);
        let Some(prior) = self.objective.center_prior() else {
            return lines;
        };

        let n = lines.len();
        let mut residuals = lines.resize_vertically(n + 2, T::zero());
        let penalty: T = nalgebra::convert(prior.penalty);
        let gx: T = nalgebra::convert(prior.center.x);
        let gy: T = nalgebra::convert(prior.center.y);
        residuals[n] = penalty.clone() * (p[0].clone() - gx);
        residuals[n + 1] = penalty * (p[1].clone() - gy);
        residuals
    }
}

/// Termination settings of the Levenberg-Marquardt run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    pub max_iterations: usize,
    /// Stop once an iteration lowers the cost by less than this fraction.
    pub function_tolerance: f64,
    /// Stop once an iteration lowers the cost by less than this amount.
    pub parameter_tolerance: f64,
    /// Stop once the cost drops below this value.
    pub min_error: f64,
    pub verbose: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            max_iterations: 100_000,
            function_tolerance: 1e-5,
            parameter_tolerance: 1e-5,
            min_error: 1e-12,
            verbose: false,
        }
    }
}

impl SolverOptions {
    /// Tolerances suited to exact synthetic data, where the cost can be driven
    /// to round-off level.
    pub fn precise() -> Self {
        Self {
            max_iterations: 500,
            function_tolerance: 1e-12,
            parameter_tolerance: 1e-18,
            min_error: 1e-20,
            verbose: false,
        }
    }

    fn stop_rule(&self) -> StopRule {
        StopRule {
            max_iterations: self.max_iterations,
            relative_decrease: self.function_tolerance,
            absolute_decrease: self.parameter_tolerance,
            min_cost: self.min_error,
        }
    }
}

/// Summary of one calibration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    /// Estimated distortion parameters.
    pub parameters: DistortionParameters,
    /// Fitted line of every group, in ideal coordinates.
    pub lines: Vec<LineFit>,
    /// Full solution vector `[cx, cy, k1, k2, theta_1, offset_1, ...]`.
    pub solution: Vec<f64>,
    pub line_count: usize,
    pub point_count: usize,
    /// Sum of squared line distances at the initial guess.
    pub initial_sum_of_squares: f64,
    /// Sum of squared line distances at the solution.
    pub final_sum_of_squares: f64,
    /// Root mean square point-to-line distance at the solution, in pixels.
    pub rms_distance: f64,
    pub elapsed_ms: u64,
    /// Why the run stopped, in words.
    pub status: String,
}

impl CalibrationReport {
    /// Writes the report to the log, the way the command line tools print it.
    pub fn log_summary(&self) {
        info!(
            "Plumb-line calibration over {} lines / {} points finished in {} ms",
            self.line_count, self.point_count, self.elapsed_ms
        );
        info!(
            "Sum of squares {:.6e} -> {:.6e}, RMS distance {:.6} px",
            self.initial_sum_of_squares, self.final_sum_of_squares, self.rms_distance
        );
        info!(
            "Status: {}. Center ({:.4}, {:.4}), k1 {:.6e}, k2 {:.6e}",
            self.status,
            self.parameters.center_x,
            self.parameters.center_y,
            self.parameters.k1(),
            self.parameters.k2()
        );
    }
}

/// Result of [`calibrate`].
#[derive(Debug, Clone)]
pub struct Calibration {
    pub model: DistortionModel,
    pub report: CalibrationReport,
}

/// Estimates center and radial coefficients that make every line group of
/// `objective` straight, starting from `seed_model`.
///
/// # Errors
///
/// * [`DistortionError::InsufficientConstraints`] when no usable line group is left.
/// * [`DistortionError::LineFitDidNotConverge`] when an initial line cannot be fitted.
/// * [`DistortionError::CalibrationDidNotConverge`] when the iteration budget
///   runs out, no step improves on the initial guess, or the cost is not finite.
pub fn calibrate(
    objective: &CalibrationObjective,
    seed_model: &DistortionModel,
    options: &SolverOptions,
) -> Result<Calibration, DistortionError> {
    calibrate_with_cancel(objective, seed_model, options, &CancellationToken::new())
}

/// [`calibrate`] that gives up with [`DistortionError::Cancelled`] once
/// `token` is cancelled. The token is checked before every solver step.
pub fn calibrate_with_cancel(
    objective: &CalibrationObjective,
    seed_model: &DistortionModel,
    options: &SolverOptions,
    token: &CancellationToken,
) -> Result<Calibration, DistortionError> {
    objective.validate()?;
    let start = Instant::now();

    let initial = objective.initial_parameters(seed_model)?;
    let initial_sum_of_squares = objective.sum_of_squares(&initial)?;

    let cost = PlumbLineCost {
        objective: objective.clone(),
    };
    let evaluator = cost.clone();
    let mut problem = tiny_solver::Problem::new();
    problem.add_residual_block(cost.residual_count(), &[PARAMS], Box::new(cost), None);

    if options.verbose {
        info!(
            "Starting plumb-line optimization: {} lines, {} points, {} parameters, initial cost {:.6e}",
            objective.line_count(),
            objective.point_count(),
            objective.parameter_count(),
            initial_sum_of_squares
        );
    }

    let penalized_cost = |p: &DVector<f64>| {
        <PlumbLineCost as Factor<f64>>::residual_func(&evaluator, std::slice::from_ref(p)).norm_squared()
    };
    let run = minimize(&problem, PARAMS, initial, penalized_cost, &options.stop_rule(), Some(token))?;
    let status = conclude(&run, options)?;

    let solution = run.params;
    let final_sum_of_squares = objective.sum_of_squares(&solution)?;
    let model = objective.model_for(&solution)?;
    let point_count = objective.point_count();
    let report = CalibrationReport {
        parameters: model.parameters().clone(),
        lines: objective.lines_for(&solution)?,
        solution: solution.iter().copied().collect(),
        line_count: objective.line_count(),
        point_count,
        initial_sum_of_squares,
        final_sum_of_squares,
        rms_distance: (final_sum_of_squares / point_count as f64).sqrt(),
        elapsed_ms: start.elapsed().as_millis() as u64,
        status,
    };

    if options.verbose {
        report.log_summary();
    }

    Ok(Calibration { model, report })
}

/// Status line of a successful run, or the reason the run failed.
fn conclude(run: &Minimization, options: &SolverOptions) -> Result<String, DistortionError> {
    let progress = format!(
        "{} iterations, {} accepted steps, cost {:.6e} -> {:.6e}",
        run.iterations, run.accepted_steps, run.initial_cost, run.final_cost
    );
    match run.termination {
        Termination::NonFinite => Err(DistortionError::CalibrationDidNotConverge(format!(
            "line distances are not finite at the initial guess ({progress})"
        ))),
        Termination::Exhausted => {
            warn!("Iteration budget of {} used up", options.max_iterations);
            Err(DistortionError::CalibrationDidNotConverge(format!(
                "iteration budget of {} exhausted before any tolerance was met, last relative decrease {:.3e} ({progress})",
                options.max_iterations, run.last_relative_decrease
            )))
        }
        _ if !run.converged() => Err(DistortionError::CalibrationDidNotConverge(format!(
            "no step lowered the cost below its initial value ({progress})"
        ))),
        termination => Ok(format!("converged: {termination} after {progress}")),
    }
}

/// A calibration task that owns its current model estimate.
pub trait Optimizer {
    /// Refines the model in place.
    ///
    /// # Arguments
    ///
    /// * `verbose` - If `true`, progress and results are logged.
    fn optimize(&mut self, verbose: bool) -> Result<(), DistortionError>;

    /// Current model estimate.
    fn get_model(&self) -> &DistortionModel;

    /// Current distortion parameters.
    fn get_parameters(&self) -> &DistortionParameters {
        self.get_model().parameters()
    }
}

/// Plumb-line calibration of a [`DistortionModel`] from straight-line groups.
#[derive(Debug, Clone)]
pub struct LineCalibration {
    model: DistortionModel,
    objective: CalibrationObjective,
    options: SolverOptions,
    report: Option<CalibrationReport>,
}

impl LineCalibration {
    /// Creates a task that starts from `model`. Focal lengths, tangential
    /// terms and skew of `model` stay fixed.
    pub fn new(model: DistortionModel, lines: Vec<crate::geometry::LineGroup>) -> Self {
        let objective = CalibrationObjective::from_model(lines, &model);
        Self::from_objective(model, objective)
    }

    pub fn from_objective(model: DistortionModel, objective: CalibrationObjective) -> Self {
        Self {
            model,
            objective,
            options: SolverOptions::default(),
            report: None,
        }
    }

    pub fn with_options(mut self, options: SolverOptions) -> Self {
        self.options = options;
        self
    }

    pub fn objective(&self) -> &CalibrationObjective {
        &self.objective
    }

    /// Report of the last successful [`Optimizer::optimize`] call.
    pub fn report(&self) -> Option<&CalibrationReport> {
        self.report.as_ref()
    }
}

impl Optimizer for LineCalibration {
    fn optimize(&mut self, verbose: bool) -> Result<(), DistortionError> {
        let options = SolverOptions {
            verbose: verbose || self.options.verbose,
            ..self.options
        };
        let calibration = calibrate(&self.objective, &self.model, &options)?;
        self.model = calibration.model;
        self.report = Some(calibration.report);
        Ok(())
    }

    fn get_model(&self) -> &DistortionModel {
        &self.model
    }
}
