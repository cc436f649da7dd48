//! Joint local refinement of every active source.
//!
//! Bounded Levenberg–Marquardt over the stacked parameter vector
//! `[x₀, y₀, I₀, x₁, y₁, I₁, …]`. Each trial step is projected onto the
//! feasible box (positions inside the patch, intensities ≥ 0) and is only
//! accepted if it strictly lowers the loss; otherwise the damping is raised
//! and the previous iterate is kept. The loss therefore never increases
//! during a refinement call.

use nalgebra::{DMatrix, DVector};
use ndarray::ArrayView2;
use tracing::debug;

use crate::error::{LocalizeError, Result};
use crate::point_source::PointSource;
use crate::residual::{ResidualEngine, PARAMS_PER_SOURCE};

/// Keeps the damped normal matrix positive definite when a parameter has no
/// influence on the model (e.g. position of a zero-intensity source).
const DIAG_FLOOR: f64 = 1e-12;

/// Scratch space for the damped normal equations `(JᵀJ + λ·diag(JᵀJ)) δ = Jᵀr`,
/// sized once per refinement call.
struct NormalEquations {
    jac: DMatrix<f64>,
    resid: DVector<f64>,
    jtj: DMatrix<f64>,
    jtr: DVector<f64>,
    /// Damped matrix, overwritten by its lower Cholesky factor.
    factor: DMatrix<f64>,
    step: DVector<f64>,
}

impl NormalEquations {
    fn new(pixels: usize, params: usize) -> Self {
        Self {
            jac: DMatrix::zeros(pixels, params),
            resid: DVector::zeros(pixels),
            jtj: DMatrix::zeros(params, params),
            jtr: DVector::zeros(params),
            factor: DMatrix::zeros(params, params),
            step: DVector::zeros(params),
        }
    }

    /// Residual, Jacobian and undamped normal equations at `sources`.
    fn assemble(&mut self, engine: &mut ResidualEngine, observed: ArrayView2<f64>, sources: &[PointSource]) {
        engine.evaluate(observed, sources);
        for (dst, &r) in self.resid.iter_mut().zip(engine.residual().iter()) {
            *dst = r;
        }
        engine.model_jacobian(sources, &mut self.jac);
        self.jac.tr_mul_to(&self.jac, &mut self.jtj);
        self.jac.tr_mul_to(&self.resid, &mut self.jtr);
    }

    /// Solve for `step` at damping `lambda`. Returns false when the damped
    /// matrix is not numerically positive definite.
    fn solve_damped(&mut self, lambda: f64) -> bool {
        let np = self.jtj.nrows();
        self.factor.copy_from(&self.jtj);
        for i in 0..np {
            self.factor[(i, i)] += lambda * self.jtj[(i, i)].max(DIAG_FLOOR);
        }

        // In-place Cholesky, A = L·Lᵀ, lower triangle only
        let l = &mut self.factor;
        for i in 0..np {
            for j in 0..=i {
                let mut sum = 0.0;
                for k in 0..j {
                    sum += l[(i, k)] * l[(j, k)];
                }
                if i == j {
                    let diag = l[(i, i)] - sum;
                    if !(diag > 0.0 && diag.is_finite()) {
                        return false;
                    }
                    l[(i, i)] = diag.sqrt();
                } else {
                    l[(i, j)] = (l[(i, j)] - sum) / l[(j, j)];
                }
            }
        }

        // L·y = Jᵀr, then Lᵀ·δ = y
        let x = &mut self.step;
        for i in 0..np {
            let mut sum = 0.0;
            for j in 0..i {
                sum += l[(i, j)] * x[j];
            }
            x[i] = (self.jtr[i] - sum) / l[(i, i)];
        }
        for i in (0..np).rev() {
            let mut sum = 0.0;
            for j in (i + 1)..np {
                sum += l[(j, i)] * x[j];
            }
            x[i] = (x[i] - sum) / l[(i, i)];
        }
        true
    }
}

/// Inclusive range of allowed source coordinates along both axes of a patch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionBounds {
    pub min: f64,
    pub max: f64,
}

impl PositionBounds {
    /// Pixel centers of a `patch_size` patch, shrunk by `margin` on each side.
    pub fn for_patch(patch_size: usize, margin: f64) -> Self {
        Self {
            min: margin,
            max: patch_size as f64 - 1.0 - margin,
        }
    }

    #[inline]
    pub fn clamp(&self, v: f64) -> f64 {
        v.clamp(self.min, self.max)
    }

    #[inline]
    pub fn contains(&self, v: f64) -> bool {
        v >= self.min && v <= self.max
    }
}

/// Configuration for [`LocalRefinement`].
#[derive(Debug, Clone)]
pub struct RefineConfig {
    /// Maximum number of accepted-or-rejected outer iterations.
    /// Default: 50
    pub max_iterations: usize,

    /// Stop once an accepted step lowers the loss by less than this fraction
    /// of the loss before the step.
    /// Default: 1e-9
    pub tolerance: f64,

    /// Starting damping factor (relative to the diagonal of JᵀJ).
    /// Default: 1e-3
    pub initial_lambda: f64,

    /// Multiplier applied to the damping on a rejected step, and divisor on
    /// an accepted one. Must be > 1.
    /// Default: 10.0
    pub lambda_factor: f64,

    /// Give up when the damping grows past this value without finding a
    /// loss-decreasing step.
    /// Default: 1e10
    pub max_lambda: f64,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-9,
            initial_lambda: 1e-3,
            lambda_factor: 10.0,
            max_lambda: 1e10,
        }
    }
}

impl RefineConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if !(self.tolerance.is_finite() && self.tolerance >= 0.0) {
            return Err(LocalizeError::InvalidRefineConfig("tolerance must be finite and >= 0"));
        }
        if !(self.initial_lambda.is_finite() && self.initial_lambda > 0.0) {
            return Err(LocalizeError::InvalidRefineConfig("initial_lambda must be finite and > 0"));
        }
        if !(self.lambda_factor.is_finite() && self.lambda_factor > 1.0) {
            return Err(LocalizeError::InvalidRefineConfig("lambda_factor must be finite and > 1"));
        }
        if !(self.max_lambda >= self.initial_lambda) {
            return Err(LocalizeError::InvalidRefineConfig("max_lambda must be >= initial_lambda"));
        }
        Ok(())
    }
}

/// Why a refinement call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefineStatus {
    /// Relative loss decrease fell below the tolerance.
    Converged,
    /// No damping up to `max_lambda` produced a lower loss.
    Stalled,
    /// Iteration budget exhausted.
    MaxIterations,
    /// The starting loss was not finite; sources were left untouched.
    NonFiniteLoss,
}

/// Result of one refinement call.
#[derive(Debug, Clone, PartialEq)]
pub struct RefineOutcome {
    pub initial_loss: f64,
    /// Loss of the returned parameters; never greater than `initial_loss`.
    pub loss: f64,
    pub iterations: usize,
    pub accepted_steps: usize,
    pub status: RefineStatus,
}

/// Bounded, monotone nonlinear least-squares refinement.
#[derive(Debug, Clone)]
pub struct LocalRefinement {
    config: RefineConfig,
    bounds: PositionBounds,
}

impl LocalRefinement {
    pub fn new(config: RefineConfig, bounds: PositionBounds) -> Self {
        Self { config, bounds }
    }

    pub fn bounds(&self) -> PositionBounds {
        self.bounds
    }

    /// Project a source onto the feasible box.
    fn project(&self, s: &mut PointSource) {
        s.x = self.bounds.clamp(s.x);
        s.y = self.bounds.clamp(s.y);
        s.intensity = s.intensity.max(0.0);
    }

    /// Refine `sources` in place against `observed`.
    ///
    /// On return `sources` holds the best iterate found, whose loss is
    /// reported in the outcome.
    pub fn run(
        &self,
        engine: &mut ResidualEngine,
        observed: ArrayView2<f64>,
        sources: &mut [PointSource],
    ) -> RefineOutcome {
        for s in sources.iter_mut() {
            self.project(s);
        }
        let initial_loss = engine.evaluate(observed, sources);
        let mut outcome = RefineOutcome {
            initial_loss,
            loss: initial_loss,
            iterations: 0,
            accepted_steps: 0,
            status: RefineStatus::MaxIterations,
        };
        if !initial_loss.is_finite() {
            outcome.status = RefineStatus::NonFiniteLoss;
            return outcome;
        }
        if sources.is_empty() {
            outcome.status = RefineStatus::Converged;
            return outcome;
        }

        let n = engine.model().patch_size();
        let mut eq = NormalEquations::new(n * n, sources.len() * PARAMS_PER_SOURCE);
        let mut trial: Vec<PointSource> = sources.to_vec();
        let mut lambda = self.config.initial_lambda;
        let mut best_loss = initial_loss;

        for iter in 0..self.config.max_iterations {
            outcome.iterations = iter + 1;
            eq.assemble(engine, observed, sources);

            let mut accepted = false;
            let mut improvement = 0.0;
            while lambda <= self.config.max_lambda {
                if !eq.solve_damped(lambda) {
                    lambda *= self.config.lambda_factor;
                    continue;
                }
                let step = &eq.step;

                for (k, (t, s)) in trial.iter_mut().zip(sources.iter()).enumerate() {
                    let base = k * PARAMS_PER_SOURCE;
                    t.x = s.x + step[base];
                    t.y = s.y + step[base + 1];
                    t.intensity = s.intensity + step[base + 2];
                    self.project(t);
                }
                let trial_loss = engine.evaluate(observed, &trial);

                if trial_loss.is_finite() && trial_loss < best_loss {
                    improvement = best_loss - trial_loss;
                    best_loss = trial_loss;
                    sources.copy_from_slice(&trial);
                    lambda = (lambda / self.config.lambda_factor).max(f64::EPSILON);
                    accepted = true;
                    break;
                }
                lambda *= self.config.lambda_factor;
            }

            if !accepted {
                outcome.status = RefineStatus::Stalled;
                break;
            }
            outcome.accepted_steps += 1;
            if improvement <= self.config.tolerance * (best_loss + improvement) {
                outcome.status = RefineStatus::Converged;
                break;
            }
        }

        outcome.loss = best_loss;
        debug!(
            "Refined {} sources: loss {:.6e} -> {:.6e} in {} iterations ({} accepted, {:?})",
            sources.len(),
            outcome.initial_loss,
            outcome.loss,
            outcome.iterations,
            outcome.accepted_steps,
            outcome.status
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::ForwardModel;

    fn setup(sigma: f64, n: usize) -> (ResidualEngine, LocalRefinement) {
        let engine = ResidualEngine::new(ForwardModel::new(sigma, n).unwrap());
        let refine = LocalRefinement::new(RefineConfig::default(), PositionBounds::for_patch(n, 0.0));
        (engine, refine)
    }

    #[test]
    fn test_recovers_perturbed_single_source() {
        let (mut engine, refine) = setup(1.5, 16);
        let truth = PointSource::new(7.3, 8.6, 50.0);
        let observed = engine.model().render(&[truth]);
        let mut sources = vec![PointSource::new(7.9, 8.0, 30.0)];
        let out = refine.run(&mut engine, observed.view(), &mut sources);
        assert!(out.loss <= out.initial_loss);
        assert!(sources[0].distance_to(&truth) < 1e-3, "{:?}", sources[0]);
        assert!((sources[0].intensity - 50.0).abs() < 1e-2);
    }

    #[test]
    fn test_intensity_stays_non_negative() {
        let (mut engine, refine) = setup(1.5, 12);
        // Observed is negative everywhere: the best non-negative fit is zero intensity
        let observed = ndarray::Array2::<f64>::from_elem((12, 12), -2.0);
        let mut sources = vec![PointSource::new(5.0, 5.0, 10.0)];
        let out = refine.run(&mut engine, observed.view(), &mut sources);
        assert!(sources[0].intensity >= 0.0);
        assert!(sources[0].intensity < 1e-6, "intensity = {}", sources[0].intensity);
        assert!(out.loss <= out.initial_loss);
    }

    #[test]
    fn test_positions_stay_in_bounds() {
        let (mut engine, refine) = setup(1.5, 12);
        // Source just outside the patch pulls the estimate towards the edge
        let observed = engine.model().render(&[PointSource::new(12.5, 5.0, 80.0)]);
        let mut sources = vec![PointSource::new(9.0, 5.0, 20.0)];
        refine.run(&mut engine, observed.view(), &mut sources);
        assert!(refine.bounds().contains(sources[0].x));
        assert!(refine.bounds().contains(sources[0].y));
    }

    #[test]
    fn test_non_finite_observation_leaves_sources_untouched() {
        let (mut engine, refine) = setup(1.5, 8);
        let mut observed = ndarray::Array2::<f64>::zeros((8, 8));
        observed[[4, 4]] = f64::INFINITY;
        let start = vec![PointSource::new(3.0, 3.0, 1.0)];
        let mut sources = start.clone();
        let out = refine.run(&mut engine, observed.view(), &mut sources);
        assert_eq!(out.status, RefineStatus::NonFiniteLoss);
        assert_eq!(sources, start);
    }

    #[test]
    fn test_damped_solve_matches_dense_cholesky() {
        let (mut engine, _) = setup(1.5, 8);
        let observed = engine.model().render(&[PointSource::new(3.2, 4.1, 20.0)]);
        let sources = [PointSource::new(3.6, 3.8, 15.0), PointSource::new(5.0, 5.0, 2.0)];
        let mut eq = NormalEquations::new(64, 6);
        eq.assemble(&mut engine, observed.view(), &sources);

        // Reused across damping values
        for lambda in [1e-2, 1.0] {
            assert!(eq.solve_damped(lambda));
            let mut h = eq.jtj.clone();
            for i in 0..6 {
                h[(i, i)] += lambda * eq.jtj[(i, i)].max(DIAG_FLOOR);
            }
            let expected = h.cholesky().unwrap().solve(&eq.jtr);
            for i in 0..6 {
                let tol = 1e-8 * expected[i].abs().max(1.0);
                assert!((eq.step[i] - expected[i]).abs() <= tol, "{} vs {}", eq.step[i], expected[i]);
            }
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let bad = RefineConfig {
            lambda_factor: 1.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        assert!(RefineConfig::default().validate().is_ok());
    }
}
