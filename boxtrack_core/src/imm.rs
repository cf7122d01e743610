//! Interacting Multiple Model Extended Kalman Filter.
//!
//! Each track carries two motion hypotheses over a shared 9-dim state:
//! constant velocity (CV) and constant turn-rate-and-velocity (CTRV).
//! The classic IMM cycle blends them: mix the model estimates under the
//! mode-transition prior, propagate each model, then weigh the models
//! by their measurement likelihood. A probability-fused estimate is
//! maintained for gating and output.
//!
//! State layout: `[x, y, z, v, yaw, yaw_rate, l, w, h]` in metres, m/s,
//! radians, rad/s, metres. Yaw is kept wrapped in (-pi, pi]; extents
//! are floored at 0.05 m; covariances are re-symmetrised after every
//! mutation so floating-point drift cannot accumulate asymmetry.

use std::f64::consts::PI;

use nalgebra::{Matrix2, SMatrix, SVector, Vector2};
use tracing::warn;

use crate::error::TrackError;
use crate::math::{angle_diff, wrap_angle};

/// Dimensionality of the filter state.
pub const STATE_DIM: usize = 9;
/// Dimensionality of a detection measurement `(x, y, z, yaw, l, w, h)`.
pub const MEAS_DIM: usize = 7;
/// Minimum box extent kept in the state, metres.
pub const MIN_EXTENT_M: f64 = 0.05;

/// Forward-difference step for numerical Jacobians.
const JACOBIAN_EPS: f64 = 1e-4;
/// Floor on per-model likelihoods before mode-probability renormalisation.
const LIKELIHOOD_FLOOR: f64 = 1e-20;
/// Floor on predicted mode masses during mixing.
const MIX_FLOOR: f64 = 1e-12;
/// Floor on the innovation-covariance determinant in the likelihood.
const DET_FLOOR: f64 = 1e-12;
/// Diagonal jitter added when the innovation covariance will not invert.
const INVERSION_JITTER: f64 = 1e-9;
/// Yaw-rate magnitude below which CTRV degrades to straight-line motion.
const TURN_RATE_EPS: f64 = 1e-4;
/// Soft damping applied to the yaw rate by the CV model.
const CV_YAW_RATE_DAMPING: f64 = 0.95;

pub type StateVector = SVector<f64, STATE_DIM>;
pub type StateMatrix = SMatrix<f64, STATE_DIM, STATE_DIM>;
pub type MeasVector = SVector<f64, MEAS_DIM>;
pub type MeasMatrix = SMatrix<f64, MEAS_DIM, MEAS_DIM>;

/// Motion hypotheses run by the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionModel {
    /// Straight-line motion at constant speed; softly damps yaw rate.
    ConstantVelocity,
    /// Circular-arc motion at constant speed and turn rate.
    ConstantTurnRate,
}

/// The fixed model bank. Index 0 is CV and index 1 is CTRV, matching
/// the rows and columns of the mode-transition matrix.
pub const MODEL_BANK: [MotionModel; 2] =
    [MotionModel::ConstantVelocity, MotionModel::ConstantTurnRate];

impl MotionModel {
    /// Propagate a state through this model over `dt` seconds.
    ///
    /// Both models leave z and the extents untouched apart from the
    /// 0.05 m floor, and both return a wrapped yaw.
    pub fn propagate(self, x: &StateVector, dt: f64) -> StateVector {
        let mut xn = *x;
        let (px, py, v, yaw, yaw_rate) = (x[0], x[1], x[3], x[4], x[5]);
        match self {
            MotionModel::ConstantVelocity => {
                xn[0] = px + v * dt * yaw.cos();
                xn[1] = py + v * dt * yaw.sin();
                xn[4] = wrap_angle(yaw);
                xn[5] = CV_YAW_RATE_DAMPING * yaw_rate;
            }
            MotionModel::ConstantTurnRate => {
                if yaw_rate.abs() > TURN_RATE_EPS {
                    xn[0] = px + (v / yaw_rate) * ((yaw + yaw_rate * dt).sin() - yaw.sin());
                    xn[1] = py - (v / yaw_rate) * ((yaw + yaw_rate * dt).cos() - yaw.cos());
                } else {
                    xn[0] = px + v * dt * yaw.cos();
                    xn[1] = py + v * dt * yaw.sin();
                }
                xn[4] = wrap_angle(yaw + yaw_rate * dt);
            }
        }
        xn[6] = xn[6].max(MIN_EXTENT_M);
        xn[7] = xn[7].max(MIN_EXTENT_M);
        xn[8] = xn[8].max(MIN_EXTENT_M);
        xn
    }
}

/// Measurement function: the observable slice of the state, with a
/// wrapped yaw entry.
fn measure(x: &StateVector) -> MeasVector {
    let mut z = MeasVector::from([x[0], x[1], x[2], x[4], x[6], x[7], x[8]]);
    z[3] = wrap_angle(z[3]);
    z
}

/// Forward-difference Jacobian of `f` at `x`.
fn jacobian_numeric<const M: usize>(
    f: impl Fn(&StateVector) -> SVector<f64, M>,
    x: &StateVector,
) -> SMatrix<f64, M, STATE_DIM> {
    let y0 = f(x);
    let mut jac = SMatrix::<f64, M, STATE_DIM>::zeros();
    for i in 0..STATE_DIM {
        let mut xp = *x;
        xp[i] += JACOBIAN_EPS;
        let column = (f(&xp) - y0) / JACOBIAN_EPS;
        jac.set_column(i, &column);
    }
    jac
}

/// `(M + M^T) / 2`, the symmetrised form kept after every mutation.
fn symmetrize<const N: usize>(m: &SMatrix<f64, N, N>) -> SMatrix<f64, N, N> {
    (m + m.transpose()) * 0.5
}

/// Invert an innovation covariance, retrying with a small diagonal
/// jitter when the direct inverse fails.
fn invert_innovation(s: &MeasMatrix) -> Option<MeasMatrix> {
    s.try_inverse()
        .or_else(|| (s + MeasMatrix::identity() * INVERSION_JITTER).try_inverse())
}

/// Per-track IMM-EKF: two model hypotheses plus their fused estimate.
#[derive(Debug, Clone)]
pub struct ImmEkf {
    /// Row-stochastic mode-transition prior.
    transition: Matrix2<f64>,
    /// Per-model state means.
    x_models: [StateVector; 2],
    /// Per-model covariances.
    p_models: [StateMatrix; 2],
    /// Mode probabilities, kept on the simplex.
    mu: Vector2<f64>,
    /// Probability-fused state, recomputed after every mutation.
    pub x: StateVector,
    /// Probability-fused covariance.
    pub p: StateMatrix,
}

impl ImmEkf {
    /// Build a filter with both models seeded from the same prior.
    ///
    /// `mode_prob_init` is renormalised to sum to 1.
    pub fn new(
        x0: StateVector,
        p0: StateMatrix,
        mode_prob_init: Vector2<f64>,
        transition: Matrix2<f64>,
    ) -> Self {
        let mu = mode_prob_init / mode_prob_init.sum();
        let mut filter = Self {
            transition,
            x_models: [x0; 2],
            p_models: [p0; 2],
            mu,
            x: x0,
            p: p0,
        };
        filter.fuse();
        filter
    }

    /// Current mode probabilities (CV, CTRV).
    pub fn mode_probabilities(&self) -> Vector2<f64> {
        self.mu
    }

    /// IMM mixing: blend the model estimates under the transition
    /// prior.
    ///
    /// Returns the mixed per-model priors and the predicted mode
    /// masses `c_j = sum_i pi_ij * mu_i`, floored so the mixing
    /// weights stay finite. The yaw component of each spread term goes
    /// through `angle_diff` so a pair of headings straddling the pi
    /// seam does not inflate the covariance.
    fn mix(&self) -> ([StateVector; 2], [StateMatrix; 2], Vector2<f64>) {
        let mut cbar = self.transition.transpose() * self.mu;
        for j in 0..2 {
            cbar[j] = cbar[j].max(MIX_FLOOR);
        }

        let mut mixed_x = [StateVector::zeros(); 2];
        let mut mixed_p = [StateMatrix::zeros(); 2];
        for j in 0..2 {
            let mut weights = Vector2::zeros();
            for i in 0..2 {
                weights[i] = self.transition[(i, j)] * self.mu[i] / cbar[j];
            }

            let mut xj = StateVector::zeros();
            for i in 0..2 {
                xj += weights[i] * self.x_models[i];
            }

            let mut pj = StateMatrix::zeros();
            for i in 0..2 {
                let mut dx = self.x_models[i] - xj;
                dx[4] = angle_diff(self.x_models[i][4], xj[4]);
                pj += weights[i] * (self.p_models[i] + dx * dx.transpose());
            }
            mixed_x[j] = xj;
            mixed_p[j] = pj;
        }
        (mixed_x, mixed_p, cbar)
    }

    /// Predict both models forward by `dt` and refresh the fused
    /// estimate. Mode probabilities move to the predicted masses.
    pub fn predict(&mut self, dt: f64, q_cv: &StateMatrix, q_ctrv: &StateMatrix) {
        let (mixed_x, mixed_p, cbar) = self.mix();
        let process_noise = [q_cv, q_ctrv];

        for (j, model) in MODEL_BANK.iter().enumerate() {
            let propagated = model.propagate(&mixed_x[j], dt);
            let f_jac = jacobian_numeric(|x| model.propagate(x, dt), &mixed_x[j]);
            let predicted_p = f_jac * mixed_p[j] * f_jac.transpose() + process_noise[j];
            self.x_models[j] = propagated;
            self.p_models[j] = symmetrize(&predicted_p);
        }

        self.mu = cbar / cbar.sum();
        self.fuse();
    }

    /// Incorporate a measurement into both models, reweigh the modes
    /// by their Gaussian likelihoods, and refresh the fused estimate.
    ///
    /// A model whose innovation covariance stays singular after
    /// jittering keeps its prediction and takes the likelihood floor.
    pub fn update(&mut self, z: &MeasVector, r: &MeasMatrix) {
        let mut likelihoods = Vector2::zeros();

        for j in 0..2 {
            let xj = self.x_models[j];
            let pj = self.p_models[j];

            let predicted = measure(&xj);
            let mut innovation = z - predicted;
            innovation[3] = angle_diff(z[3], predicted[3]);

            let h_jac = jacobian_numeric(measure, &xj);
            let s = symmetrize(&(h_jac * pj * h_jac.transpose() + r));
            let Some(s_inv) = invert_innovation(&s) else {
                warn!(
                    model = ?MODEL_BANK[j],
                    "singular innovation covariance, keeping prediction"
                );
                likelihoods[j] = LIKELIHOOD_FLOOR;
                continue;
            };

            let gain = pj * h_jac.transpose() * s_inv;
            let mut updated = xj + gain * innovation;
            updated[4] = wrap_angle(updated[4]);
            updated[6] = updated[6].max(MIN_EXTENT_M);
            updated[7] = updated[7].max(MIN_EXTENT_M);
            updated[8] = updated[8].max(MIN_EXTENT_M);
            let updated_p = symmetrize(&((StateMatrix::identity() - gain * h_jac) * pj));

            let mahalanobis = (innovation.transpose() * s_inv * innovation)[(0, 0)];
            let norm =
                ((2.0 * PI).powi(MEAS_DIM as i32) * s.determinant().max(DET_FLOOR)).sqrt();
            likelihoods[j] = (-0.5 * mahalanobis).exp() / norm;

            self.x_models[j] = updated;
            self.p_models[j] = updated_p;
        }

        for j in 0..2 {
            self.mu[j] *= likelihoods[j].max(LIKELIHOOD_FLOOR);
        }
        self.mu /= self.mu.sum();
        self.fuse();
    }

    /// Squared Mahalanobis distance of a measurement under the fused
    /// estimate. Pure query: no filter state changes.
    ///
    /// Reports `Numeric` when the innovation covariance cannot be
    /// inverted even after jittering; callers treat that pairing as
    /// ungated for the frame.
    pub fn innovation_mahalanobis(
        &self,
        z: &MeasVector,
        r: &MeasMatrix,
    ) -> Result<f64, TrackError> {
        let predicted = measure(&self.x);
        let mut innovation = z - predicted;
        innovation[3] = angle_diff(z[3], predicted[3]);

        let h_jac = jacobian_numeric(measure, &self.x);
        let s = symmetrize(&(h_jac * self.p * h_jac.transpose() + r));
        let s_inv = invert_innovation(&s).ok_or_else(|| {
            TrackError::Numeric("innovation covariance is singular".to_string())
        })?;
        Ok((innovation.transpose() * s_inv * innovation)[(0, 0)])
    }

    /// Recompute the fused `(x, P)` from the model bank and the mode
    /// probabilities.
    fn fuse(&mut self) {
        let mu = self.mu;

        let mut xf = StateVector::zeros();
        for i in 0..2 {
            xf += mu[i] * self.x_models[i];
        }

        let mut pf = StateMatrix::zeros();
        for i in 0..2 {
            let mut dx = self.x_models[i] - xf;
            dx[4] = angle_diff(self.x_models[i][4], xf[4]);
            pf += mu[i] * (self.p_models[i] + dx * dx.transpose());
        }

        self.x = xf;
        self.x[4] = wrap_angle(self.x[4]);
        self.p = symmetrize(&pf);
    }
}
