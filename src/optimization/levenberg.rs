//! Damped least squares driver shared by the line fitter and the plumb-line
//! calibration.
//!
//! tiny-solver's Levenberg-Marquardt loop stops as soon as one iteration leaves
//! the cost unchanged, which includes every rejected step. The driver below
//! asks tiny-solver for one step at a time and keeps the damping itself: a
//! step that lowers the cost is accepted and the damping shrinks, any other
//! step is discarded and the damping grows until the solver either moves again
//! or the point is stationary.

use crate::distortion::DistortionError;
use crate::jobs::CancellationToken;
use log::{debug, trace};
use nalgebra::DVector;
use std::collections::HashMap;
use std::fmt;
use tiny_solver::optimizer::OptimizerOptions;
use tiny_solver::{LevenbergMarquardtOptimizer, Optimizer as TinySolverOptimizer, Problem};

const MIN_DIAGONAL: f64 = 1e-6;
const MAX_DIAGONAL: f64 = 1e32;
/// tiny-solver's own starting damping, `1 / 1e4`.
const INITIAL_DAMPING: f64 = 1e-4;
const MIN_DAMPING: f64 = 1e-10;
/// Above this damping a step is a vanishing gradient step.
const MAX_DAMPING: f64 = 1e16;
/// Decrease tests only apply while the damped step is close to a Gauss-Newton
/// step. A short, heavily damped step says nothing about convergence.
const TRUSTED_DAMPING: f64 = 1.0;

/// When to stop iterating.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct StopRule {
    pub max_iterations: usize,
    pub relative_decrease: f64,
    pub absolute_decrease: f64,
    pub min_cost: f64,
}

/// Why [`minimize`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Termination {
    /// The cost dropped below [`StopRule::min_cost`].
    MinCost,
    /// A lightly damped step lowered the cost by less than the tolerances.
    SmallDecrease,
    /// No step lowers the cost any more, whatever the damping.
    Stationary,
    /// The iteration budget ran out first.
    Exhausted,
    /// The cost at the starting point is not finite.
    NonFinite,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Termination::MinCost => "cost below minimum error",
            Termination::SmallDecrease => "cost decrease below tolerance",
            Termination::Stationary => "no descent step left",
            Termination::Exhausted => "iteration budget exhausted",
            Termination::NonFinite => "non-finite cost",
        };
        f.write_str(text)
    }
}

/// Outcome of one [`minimize`] run.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Minimization {
    pub params: DVector<f64>,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub iterations: usize,
    pub accepted_steps: usize,
    /// Relative cost decrease of the last accepted step.
    pub last_relative_decrease: f64,
    pub termination: Termination,
}

impl Minimization {
    pub fn made_progress(&self) -> bool {
        self.final_cost < self.initial_cost
    }

    /// `true` when the run ended on one of the convergence tests.
    pub fn converged(&self) -> bool {
        match self.termination {
            Termination::MinCost | Termination::SmallDecrease => true,
            Termination::Stationary => self.made_progress(),
            Termination::Exhausted | Termination::NonFinite => false,
        }
    }
}

/// Minimizes the sum of squared residuals of `problem` over its single
/// variable `name`, starting from `initial`.
///
/// `cost` must evaluate the same sum of squares the problem's factors produce.
/// It decides whether a proposed step is accepted.
///
/// # Errors
///
/// [`DistortionError::Cancelled`] once `token` is cancelled. It is checked
/// before every step.
pub(crate) fn minimize<C>(
    problem: &Problem,
    name: &str,
    initial: DVector<f64>,
    cost: C,
    rule: &StopRule,
    token: Option<&CancellationToken>,
) -> Result<Minimization, DistortionError>
where
    C: Fn(&DVector<f64>) -> f64,
{
    let initial_cost = cost(&initial);
    let mut run = Minimization {
        params: initial,
        initial_cost,
        final_cost: initial_cost,
        iterations: 0,
        accepted_steps: 0,
        last_relative_decrease: f64::NAN,
        termination: Termination::Exhausted,
    };
    if !initial_cost.is_finite() {
        run.termination = Termination::NonFinite;
        return Ok(run);
    }
    if initial_cost <= rule.min_cost {
        run.termination = Termination::MinCost;
        return Ok(run);
    }

    let one_step = OptimizerOptions {
        max_iteration: 1,
        verbosity_level: 0,
        ..OptimizerOptions::default()
    };
    let mut damping = INITIAL_DAMPING;
    let mut growth = 2.0;

    while run.iterations < rule.max_iterations {
        if let Some(token) = token {
            token.check()?;
        }
        run.iterations += 1;

        let mut values = HashMap::new();
        values.insert(name.to_string(), run.params.clone());
        let optimizer = LevenbergMarquardtOptimizer::new(MIN_DIAGONAL, MAX_DIAGONAL, 1.0 / damping);
        let candidate = optimizer
            .optimize(problem, &values, Some(one_step.clone()))
            .and_then(|mut result| result.remove(name))
            .filter(|params| params.iter().all(|v| v.is_finite()))
            .map(|params| {
                let candidate_cost = cost(&params);
                (params, candidate_cost)
            })
            .filter(|(_, candidate_cost)| candidate_cost.is_finite() && *candidate_cost < run.final_cost);

        let Some((params, candidate_cost)) = candidate else {
            damping *= growth;
            growth *= 2.0;
            trace!("step {} rejected, damping {:.3e}", run.iterations, damping);
            if damping > MAX_DAMPING {
                run.termination = Termination::Stationary;
                break;
            }
            continue;
        };

        let decrease = run.final_cost - candidate_cost;
        run.last_relative_decrease = decrease / run.final_cost;
        run.params = params;
        run.final_cost = candidate_cost;
        run.accepted_steps += 1;
        trace!(
            "step {} accepted, cost {:.6e}, damping {:.3e}",
            run.iterations,
            candidate_cost,
            damping
        );

        if candidate_cost <= rule.min_cost {
            run.termination = Termination::MinCost;
            break;
        }
        if damping <= TRUSTED_DAMPING
            && (decrease < rule.absolute_decrease || run.last_relative_decrease < rule.relative_decrease)
        {
            run.termination = Termination::SmallDecrease;
            break;
        }
        damping = (damping / 3.0).max(MIN_DAMPING);
        growth = 2.0;
    }

    debug!(
        "{}: {} after {} iterations ({} accepted), cost {:.6e} -> {:.6e}",
        name,
        run.termination,
        run.iterations,
        run.accepted_steps,
        run.initial_cost,
        run.final_cost
    );
    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::RealField;
    use tiny_solver::factors::Factor;

    /// Residuals `(x0 - 3, 10 * (x1 - x0²))`, a scaled Rosenbrock valley.
    #[derive(Debug, Clone)]
    struct Valley;

    impl<T: RealField> Factor<T> for Valley {
        fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
            let x = &params[0];
            let three: T = nalgebra::convert(3.0);
            let ten: T = nalgebra::convert(10.0);
            DVector::from_vec(vec![
                x[0].clone() - three,
                ten * (x[1].clone() - x[0].clone() * x[0].clone()),
            ])
        }
    }

    /// Residual `x² + 1`, stationary at the origin with cost 1.
    #[derive(Debug, Clone)]
    struct Bowl;

    impl<T: RealField> Factor<T> for Bowl {
        fn residual_func(&self, params: &[DVector<T>]) -> DVector<T> {
            let x = params[0][0].clone();
            DVector::from_vec(vec![x.clone() * x + T::one()])
        }
    }

    fn valley_cost(x: &DVector<f64>) -> f64 {
        (x[0] - 3.0).powi(2) + (10.0 * (x[1] - x[0] * x[0])).powi(2)
    }

    fn problem_with<F>(factor: F, residuals: usize) -> Problem
    where
        F: tiny_solver::factors::FactorImpl + Send + 'static,
    {
        let mut problem = Problem::new();
        problem.add_residual_block(residuals, &["x"], Box::new(factor), None);
        problem
    }

    fn rule(max_iterations: usize) -> StopRule {
        StopRule {
            max_iterations,
            relative_decrease: 1e-12,
            absolute_decrease: 1e-20,
            min_cost: 1e-20,
        }
    }

    #[test]
    fn test_walks_down_curved_valley() {
        let problem = problem_with(Valley, 2);
        let run = minimize(&problem, "x", DVector::from_vec(vec![-2.0, 8.0]), valley_cost, &rule(500), None).unwrap();
        assert!(run.converged(), "{run:?}");
        assert!((run.params[0] - 3.0).abs() < 1e-6, "{run:?}");
        assert!((run.params[1] - 9.0).abs() < 1e-5, "{run:?}");
        assert!(run.accepted_steps > 1);
    }

    #[test]
    fn test_budget_exhaustion_is_reported() {
        let problem = problem_with(Valley, 2);
        let run = minimize(&problem, "x", DVector::from_vec(vec![-2.0, 8.0]), valley_cost, &rule(1), None).unwrap();
        assert_eq!(run.iterations, 1);
        assert_eq!(run.termination, Termination::Exhausted);
        assert!(!run.converged());
    }

    #[test]
    fn test_stationary_start_makes_no_progress() {
        let problem = problem_with(Bowl, 1);
        let cost = |x: &DVector<f64>| (x[0] * x[0] + 1.0).powi(2);
        let run = minimize(&problem, "x", DVector::from_vec(vec![0.0]), cost, &rule(500), None).unwrap();
        assert_eq!(run.termination, Termination::Stationary);
        assert_eq!(run.accepted_steps, 0);
        assert_eq!(run.final_cost, 1.0);
        assert!(!run.made_progress());
        assert!(!run.converged());
    }

    #[test]
    fn test_non_finite_start() {
        let problem = problem_with(Valley, 2);
        let run = minimize(&problem, "x", DVector::from_vec(vec![f64::NAN, 0.0]), valley_cost, &rule(10), None).unwrap();
        assert_eq!(run.termination, Termination::NonFinite);
        assert_eq!(run.iterations, 0);
    }

    #[test]
    fn test_cancelled_before_first_step() {
        let problem = problem_with(Valley, 2);
        let token = CancellationToken::new();
        token.cancel();
        let err = minimize(&problem, "x", DVector::from_vec(vec![-2.0, 8.0]), valley_cost, &rule(10), Some(&token))
            .unwrap_err();
        assert_eq!(err, DistortionError::Cancelled);
    }
}
