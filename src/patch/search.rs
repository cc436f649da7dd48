//! The insert → refine → check search loop.

use ndarray::ArrayView2;
use tracing::debug;

use crate::error::Result;
use crate::point_source::PointSource;
use crate::residual::ResidualEngine;

use super::{Patch, PatchFit, PatchLocalizer, StopReason};

impl PatchLocalizer {
    /// Localize sources in a `patch_size × patch_size` block of pixels.
    ///
    /// Returned coordinates are patch-local (pixel `[[r, c]]` is centered at
    /// `x = c`, `y = r`). The only error is a shape mismatch; non-finite pixels
    /// stop the search with [`StopReason::NonFiniteLoss`] and return the last
    /// set of sources whose loss was finite.
    pub fn localize(&self, observed: ArrayView2<f64>) -> Result<PatchFit> {
        self.check_shape(&observed)?;
        let max_sources = self.config.max_sources;
        let min_improvement = self.config.min_improvement;

        // ── INIT ──
        let mut engine = ResidualEngine::new(self.model);
        let mut corr = self.insertion.buffers();
        let initial_loss = engine.evaluate(observed, &[]);
        let mut active: Vec<PointSource> = Vec::with_capacity(max_sources);
        let mut trial: Vec<PointSource> = Vec::with_capacity(max_sources);
        let mut loss = initial_loss;
        let mut loss_history = Vec::with_capacity(max_sources + 1);

        if !initial_loss.is_finite() {
            debug!("Patch has non-finite pixels; nothing localized");
            return Ok(PatchFit {
                sources: active,
                loss,
                initial_loss,
                loss_history,
                stop_reason: StopReason::NonFiniteLoss,
            });
        }
        loss_history.push(initial_loss);

        let stop_reason = loop {
            if active.len() >= max_sources {
                break StopReason::MaxSources;
            }

            // ── INSERT ──
            // Refinement leaves the engine holding its last trial, so the
            // residual of the accepted set is recomputed here.
            engine.evaluate(observed, &active);
            let Some(candidate) = self.insertion.propose_with(engine.residual(), &mut corr) else {
                break StopReason::NoCandidate;
            };
            trial.clear();
            trial.extend_from_slice(&active);
            trial.push(candidate);

            // ── REFINE ──
            let outcome = self.refinement.run(&mut engine, observed, &mut trial);
            if !outcome.loss.is_finite() {
                break StopReason::NonFiniteLoss;
            }

            // ── CHECK ──
            let delta = loss - outcome.loss;
            if trial.len() == max_sources {
                debug!(
                    "Accepted source {} at ({:.3}, {:.3}) I={:.3}; delta={:.4e}; cap reached",
                    trial.len(),
                    candidate.x,
                    candidate.y,
                    candidate.intensity,
                    delta
                );
                std::mem::swap(&mut active, &mut trial);
                loss = outcome.loss;
                loss_history.push(loss);
                break StopReason::MaxSources;
            }
            if delta < min_improvement {
                debug!(
                    "Rolled back source {}: delta={:.4e} < min_improvement={:.4e}",
                    trial.len(),
                    delta,
                    min_improvement
                );
                break StopReason::InsufficientImprovement;
            }
            debug!(
                "Accepted source {} at ({:.3}, {:.3}) I={:.3}; delta={:.4e}",
                trial.len(),
                candidate.x,
                candidate.y,
                candidate.intensity,
                delta
            );
            std::mem::swap(&mut active, &mut trial);
            loss = outcome.loss;
            loss_history.push(loss);
        };

        Ok(PatchFit {
            sources: active,
            loss,
            initial_loss,
            loss_history,
            stop_reason,
        })
    }

    /// Localize a [`Patch`] and return sources in the coordinates of the image
    /// the patch was taken from.
    pub fn localize_patch(&self, patch: &Patch) -> Result<PatchFit> {
        let mut fit = self.localize(patch.pixels.view())?;
        let (dx, dy) = (patch.origin_col as f64, patch.origin_row as f64);
        for s in fit.sources.iter_mut() {
            *s = s.translated(dx, dy);
        }
        Ok(fit)
    }
}
