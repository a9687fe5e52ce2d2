//! Resilient back-propagation over the feature table.
//!
//! One sweep per iteration: each feature is pruned, skipped, or updated from
//! the sign of its orthant-projected gradient with a per-dimension adaptive
//! step. Regularization is per tag: rho1 (L1), rho2 (L2), and rho3, an L1
//! penalty scaled by the feature's occurrence frequency.
//!
//! Reference: Riedmiller & Braun, "A direct adaptive method for faster
//! backpropagation learning: the RPROP algorithm" (ICNN 1993).

use crate::model::{tag_of, Model};

const EPSILON: f64 = f64::EPSILON * 64.0;

/// RPROP settings: step-size control and per-tag regularization strengths.
pub struct Rprop {
    pub rho1: [f64; 128],
    pub rho2: [f64; 128],
    pub rho3: [f64; 128],
    pub stpinc: f64,
    pub stpdec: f64,
    pub stpmin: f64,
    pub stpmax: f64,
}

impl Default for Rprop {
    fn default() -> Self {
        Self {
            rho1: [0.0; 128],
            rho2: [0.0; 128],
            rho3: [0.0; 128],
            stpinc: 1.2,
            stpdec: 0.5,
            stpmin: 1e-8,
            stpmax: 50.0,
        }
    }
}

impl Rprop {
    /// Performs one optimization step over every feature of the model.
    ///
    /// `ll` is the log-likelihood value returned by the gradient pass; the
    /// regularized objective is accumulated on top of it for reporting. The
    /// gradient cells are consumed and cleared.
    pub fn step(&self, model: &mut Model, ll: f64) {
        let itr = model.iteration();
        let snapshot: Vec<(u64, std::sync::Arc<crate::model::Feature>)> = model
            .features()
            .map(|(key, ftr)| (key, std::sync::Arc::clone(ftr)))
            .collect();
        let mut fx = ll;
        let mut nx = 0.0;
        let mut ng = 0.0;
        let mut nd = 0.0;
        let mut removed = 0usize;
        for (key, ftr) in snapshot {
            let tag = tag_of(key);
            let x = ftr.weight();
            // Pruning: a zero weight past the tag's removal point, or an
            // occurrence count below the survival threshold.
            if x == 0.0 && model.tag_remove(tag) <= itr {
                model.remove_feature(key);
                removed += 1;
                continue;
            }
            if ftr.freq() < model.min_freq() {
                model.remove_feature(key);
                removed += 1;
                continue;
            }
            if model.tag_start(tag) > itr {
                continue;
            }
            // A zero step size marks a feature created since the last sweep.
            if ftr.step() == 0.0 {
                ftr.set_step(0.1);
            }
            let rho1 = self.rho1[tag];
            let rho2 = self.rho2[tag];
            let rho3 = self.rho3[tag];
            let frq = f64::from(ftr.freq());
            let mut g = ftr.grad() + rho2 * x;
            fx += rho2 * x * x / 2.0;
            fx += rho1 * x.abs();
            fx += rho3 * frq * x.abs();
            // Project the gradient into the current orthant so the L1 terms
            // stay differentiable.
            let a = rho1 + rho3 * frq;
            let mut pg = g;
            if a != 0.0 {
                if x < -EPSILON {
                    pg -= a;
                } else if x > EPSILON {
                    pg += a;
                } else if g < -a {
                    pg += a;
                } else if g > a {
                    pg -= a;
                } else {
                    pg = 0.0;
                }
            }
            // Adapt the step from the sign agreement with the previous
            // gradient.
            let sgn = ftr.prev_grad() * pg;
            if sgn < -EPSILON {
                ftr.set_step((ftr.step() * self.stpdec).max(self.stpmin));
            } else if sgn > EPSILON {
                ftr.set_step((ftr.step() * self.stpinc).min(self.stpmax));
            }
            // On a sign flip, take back the previous update and restart the
            // gradient memory; otherwise step against the projected
            // gradient, guarded so the step never goes uphill on the L1
            // objective.
            if sgn < 0.0 {
                ftr.set_weight(x - ftr.delta());
                g = 0.0;
            } else {
                let mut dlt = if pg < -EPSILON {
                    ftr.step()
                } else if pg > EPSILON {
                    -ftr.step()
                } else {
                    0.0
                };
                if rho1 != 0.0 && dlt * pg >= 0.0 {
                    dlt = 0.0;
                }
                ftr.set_delta(dlt);
                ftr.set_weight(x + dlt);
            }
            nx += ftr.weight().abs();
            ng += g.abs();
            nd += ftr.delta().abs();
            ftr.reset_freq();
            ftr.set_prev_grad(g);
            ftr.set_grad(0.0);
        }
        model.purge();
        if removed > 0 {
            log::debug!("removed {removed} features");
        }
        log::info!("ll={:.2} fx={fx:.2} |x|={nx:.2} |g|={ng:.2} |d|={nd:.2}", -ll);
    }
}
