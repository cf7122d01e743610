//! Typed tracker configuration.
//!
//! Sections mirror the YAML config file one to one; the engine never
//! reads free-form maps. Label-indexed tables (`min_hits`, `max_age_s`,
//! `meas_by_class`) resolve unknown labels through a mandatory
//! `default` entry, and `validate` rejects configs that could put the
//! filter or the gates into an undefined regime.

use std::collections::HashMap;

use nalgebra::{Matrix2, Vector2};
use serde::Deserialize;

use crate::error::TrackError;
use crate::imm::{MeasMatrix, MeasVector, StateMatrix, StateVector};

/// Key every label-indexed table must contain.
pub const DEFAULT_LABEL: &str = "default";

// ============================================================================
// SECTIONS
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackerConfig {
    pub tracker: TrackerSection,
    pub association: AssociationSection,
    pub noise: NoiseSection,
    pub imm: ImmSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackerSection {
    /// dt assumed for the very first frame, seconds.
    pub dt_fallback_s: f64,
    /// Multiplier applied to every track's score EMA during predict.
    pub existence_decay: f64,
    /// Minimum score EMA for a tentative track to confirm.
    pub confirm_score_threshold: f64,
    /// Minimum detection score to spawn a new track.
    pub init_score_threshold: f64,
    /// Hits needed to confirm, per label.
    pub min_hits: HashMap<String, u32>,
    /// Staleness budget before deletion, per label, seconds.
    pub max_age_s: HashMap<String, f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssociationSection {
    /// Gate on the squared innovation Mahalanobis distance.
    pub maha_gate_threshold: f64,
    /// Planar center-distance gate for the rescue stage, metres.
    pub second_stage_center_gate_m: f64,
    pub cost_weights: CostWeights,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CostWeights {
    pub maha: f64,
    pub iou: f64,
    pub yaw: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoiseSection {
    /// Process-noise standard deviations for the CV model.
    pub process_cv_diag: [f64; 9],
    /// Process-noise standard deviations for the CTRV model.
    pub process_ctrv_diag: [f64; 9],
    /// Measurement standard deviations per label.
    pub meas_by_class: HashMap<String, [f64; 7]>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImmSection {
    /// 2x2 row-stochastic mode-transition matrix.
    pub transition: [[f64; 2]; 2],
    /// Initial mode probabilities; renormalised to sum 1.
    pub mode_prob_init: [f64; 2],
}

// ============================================================================
// LABEL TABLES
// ============================================================================

/// Label-indexed lookup with a mandatory `default` fallback entry.
#[derive(Debug, Clone)]
pub struct LabelTable<T> {
    by_label: HashMap<String, T>,
    fallback: T,
}

impl<T: Copy> LabelTable<T> {
    /// Build a table, converting each configured value. Fails when the
    /// map has no `default` entry.
    pub fn from_map<V, F>(
        name: &str,
        map: &HashMap<String, V>,
        convert: F,
    ) -> Result<Self, TrackError>
    where
        F: Fn(&V) -> T,
    {
        let by_label: HashMap<String, T> =
            map.iter().map(|(k, v)| (k.clone(), convert(v))).collect();
        let fallback = *by_label.get(DEFAULT_LABEL).ok_or_else(|| {
            TrackError::Config(format!("{name} must contain a \"default\" entry"))
        })?;
        Ok(Self { by_label, fallback })
    }

    /// Value for `label`, or the `default` entry.
    pub fn get(&self, label: &str) -> T {
        self.by_label.get(label).copied().unwrap_or(self.fallback)
    }
}

// ============================================================================
// DERIVED QUANTITIES
// ============================================================================

fn diag_squared_9(std_devs: &[f64; 9]) -> StateMatrix {
    StateMatrix::from_diagonal(&StateVector::from(std_devs.map(|s| s * s)))
}

fn diag_squared_7(std_devs: &[f64; 7]) -> MeasMatrix {
    MeasMatrix::from_diagonal(&MeasVector::from(std_devs.map(|s| s * s)))
}

impl NoiseSection {
    /// Process-noise covariance for the CV model.
    pub fn q_cv(&self) -> StateMatrix {
        diag_squared_9(&self.process_cv_diag)
    }

    /// Process-noise covariance for the CTRV model.
    pub fn q_ctrv(&self) -> StateMatrix {
        diag_squared_9(&self.process_ctrv_diag)
    }

    /// Per-label measurement covariances with the `default` fallback.
    pub fn meas_cov_table(&self) -> Result<LabelTable<MeasMatrix>, TrackError> {
        LabelTable::from_map("noise.meas_by_class", &self.meas_by_class, diag_squared_7)
    }
}

impl TrackerSection {
    pub fn min_hits_table(&self) -> Result<LabelTable<u32>, TrackError> {
        LabelTable::from_map("tracker.min_hits", &self.min_hits, |v| *v)
    }

    pub fn max_age_table(&self) -> Result<LabelTable<f64>, TrackError> {
        LabelTable::from_map("tracker.max_age_s", &self.max_age_s, |v| *v)
    }
}

impl ImmSection {
    pub fn transition_matrix(&self) -> Matrix2<f64> {
        Matrix2::new(
            self.transition[0][0],
            self.transition[0][1],
            self.transition[1][0],
            self.transition[1][1],
        )
    }

    /// Initial mode probabilities, renormalised to sum to 1.
    pub fn initial_mode_probabilities(&self) -> Vector2<f64> {
        let raw = Vector2::new(self.mode_prob_init[0], self.mode_prob_init[1]);
        raw / raw.sum()
    }
}

// ============================================================================
// VALIDATION
// ============================================================================

fn config_err(message: impl Into<String>) -> TrackError {
    TrackError::Config(message.into())
}

impl TrackerConfig {
    /// Reject configurations the engine cannot run safely.
    pub fn validate(&self) -> Result<(), TrackError> {
        let t = &self.tracker;
        if !(t.dt_fallback_s > 0.0) {
            return Err(config_err("tracker.dt_fallback_s must be positive"));
        }
        if !(t.existence_decay > 0.0 && t.existence_decay <= 1.0) {
            return Err(config_err("tracker.existence_decay must be in (0, 1]"));
        }
        if !(t.confirm_score_threshold.is_finite() && t.confirm_score_threshold >= 0.0) {
            return Err(config_err(
                "tracker.confirm_score_threshold must be finite and non-negative",
            ));
        }
        if !(t.init_score_threshold.is_finite() && t.init_score_threshold >= 0.0) {
            return Err(config_err(
                "tracker.init_score_threshold must be finite and non-negative",
            ));
        }
        if !t.min_hits.contains_key(DEFAULT_LABEL) {
            return Err(config_err("tracker.min_hits must contain a \"default\" entry"));
        }
        if t.min_hits.values().any(|&v| v == 0) {
            return Err(config_err("tracker.min_hits entries must be at least 1"));
        }
        if !t.max_age_s.contains_key(DEFAULT_LABEL) {
            return Err(config_err("tracker.max_age_s must contain a \"default\" entry"));
        }
        if t.max_age_s.values().any(|v| !(*v > 0.0)) {
            return Err(config_err("tracker.max_age_s entries must be positive"));
        }

        let a = &self.association;
        if !(a.maha_gate_threshold > 0.0) {
            return Err(config_err("association.maha_gate_threshold must be positive"));
        }
        if !(a.second_stage_center_gate_m > 0.0) {
            return Err(config_err(
                "association.second_stage_center_gate_m must be positive",
            ));
        }
        for (name, weight) in [
            ("maha", a.cost_weights.maha),
            ("iou", a.cost_weights.iou),
            ("yaw", a.cost_weights.yaw),
        ] {
            if !(weight.is_finite() && weight >= 0.0) {
                return Err(config_err(format!(
                    "association.cost_weights.{name} must be finite and non-negative"
                )));
            }
        }

        let n = &self.noise;
        if n.process_cv_diag.iter().any(|s| !(*s > 0.0)) {
            return Err(config_err("noise.process_cv_diag entries must be positive"));
        }
        if n.process_ctrv_diag.iter().any(|s| !(*s > 0.0)) {
            return Err(config_err("noise.process_ctrv_diag entries must be positive"));
        }
        if !n.meas_by_class.contains_key(DEFAULT_LABEL) {
            return Err(config_err(
                "noise.meas_by_class must contain a \"default\" entry",
            ));
        }
        for (label, sigma) in &n.meas_by_class {
            if sigma.iter().any(|s| !(*s > 0.0)) {
                return Err(config_err(format!(
                    "noise.meas_by_class[{label}] entries must be positive"
                )));
            }
        }

        let imm = &self.imm;
        for (row_idx, row) in imm.transition.iter().enumerate() {
            if row.iter().any(|p| !(*p >= 0.0)) {
                return Err(config_err(format!(
                    "imm.transition row {row_idx} must be non-negative"
                )));
            }
            if (row.iter().sum::<f64>() - 1.0).abs() > 1e-6 {
                return Err(config_err(format!(
                    "imm.transition row {row_idx} must sum to 1"
                )));
            }
        }
        if imm.mode_prob_init.iter().any(|p| !(*p >= 0.0)) {
            return Err(config_err("imm.mode_prob_init must be non-negative"));
        }
        if !(imm.mode_prob_init.iter().sum::<f64>() > 0.0) {
            return Err(config_err("imm.mode_prob_init must have positive mass"));
        }

        Ok(())
    }
}

impl Default for TrackerConfig {
    /// Matches `configs/default.yaml` at the repository root.
    fn default() -> Self {
        Self {
            tracker: TrackerSection {
                dt_fallback_s: 0.1,
                existence_decay: 0.95,
                confirm_score_threshold: 0.5,
                init_score_threshold: 0.3,
                min_hits: HashMap::from([
                    (DEFAULT_LABEL.to_string(), 2),
                    ("car".to_string(), 3),
                ]),
                max_age_s: HashMap::from([
                    (DEFAULT_LABEL.to_string(), 1.0),
                    ("pedestrian".to_string(), 0.8),
                ]),
            },
            association: AssociationSection {
                maha_gate_threshold: 14.07,
                second_stage_center_gate_m: 2.0,
                cost_weights: CostWeights {
                    maha: 0.5,
                    iou: 0.3,
                    yaw: 0.2,
                },
            },
            noise: NoiseSection {
                process_cv_diag: [0.6, 0.6, 0.3, 0.8, 0.08, 0.05, 0.05, 0.05, 0.05],
                process_ctrv_diag: [0.5, 0.5, 0.3, 0.6, 0.12, 0.15, 0.05, 0.05, 0.05],
                meas_by_class: HashMap::from([
                    (
                        DEFAULT_LABEL.to_string(),
                        [0.6, 0.6, 0.4, 0.3, 0.3, 0.25, 0.25],
                    ),
                    (
                        "car".to_string(),
                        [0.5, 0.5, 0.35, 0.25, 0.3, 0.2, 0.2],
                    ),
                    (
                        "pedestrian".to_string(),
                        [0.35, 0.35, 0.3, 0.5, 0.15, 0.15, 0.2],
                    ),
                ]),
            },
            imm: ImmSection {
                transition: [[0.9, 0.1], [0.1, 0.9]],
                mode_prob_init: [0.6, 0.4],
            },
        }
    }
}
