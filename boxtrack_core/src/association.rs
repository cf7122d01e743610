//! Two-stage detection-to-track association.
//!
//! Stage 1 solves a gated minimum-cost assignment (Jonker-Volgenant)
//! over Mahalanobis, BEV-IoU, and heading terms. Stage 2 rescues
//! leftover same-label pairs whose predicted centers sit within a
//! planar distance gate: a track that overshot its prediction can have
//! near-zero IoU while still being the same object.

use lapjv::{lapjv, Matrix};
use tracing::warn;

use crate::config::AssociationSection;
use crate::geometry::{bev_iou, yaw_cost};
use crate::imm::MeasMatrix;
use crate::track::TrackNode;
use crate::types::Detection;

/// Cost carried by forbidden pairs (label mismatch, gate failure,
/// padding).
pub const GATED_COST: f64 = 1e6;
/// Assignments at or above this cost are discarded after the solve;
/// this keeps the gate semantics intact under square padding.
pub const GATE_REJECT_COST: f64 = 1e5;

/// Outcome of one frame's association.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Association {
    /// `(track_id, detection index)` pairs.
    pub matches: Vec<(u64, usize)>,
    pub unmatched_tracks: Vec<u64>,
    pub unmatched_detections: Vec<usize>,
}

/// Cost of pairing one track with one detection, or `None` when the
/// pair is forbidden: label mismatch, Mahalanobis gate exceeded, or an
/// uninvertible innovation covariance (treated as ungated this frame).
fn pair_cost<F>(
    track: &TrackNode,
    detection: &Detection,
    cfg: &AssociationSection,
    meas_cov: &F,
) -> Option<f64>
where
    F: Fn(&str) -> MeasMatrix,
{
    if track.label != detection.label {
        return None;
    }

    let r = meas_cov(&track.label);
    let mahalanobis = match track
        .filter
        .innovation_mahalanobis(&detection.measurement(), &r)
    {
        Ok(d) => d,
        Err(err) => {
            warn!(track_id = track.track_id, %err, "pair left ungated");
            return None;
        }
    };
    if mahalanobis > cfg.maha_gate_threshold {
        return None;
    }

    let iou_term = 1.0 - bev_iou(&track.filter.x, &detection.as_state());
    let yaw_term = yaw_cost(track.filter.x[4], detection.yaw);
    Some(
        cfg.cost_weights.maha * (mahalanobis / cfg.maha_gate_threshold)
            + cfg.cost_weights.iou * iou_term
            + cfg.cost_weights.yaw * yaw_term,
    )
}

/// Square cost matrix for the assignment solver. Padded rows/columns
/// (and every forbidden pair) carry `GATED_COST`; the matrix is padded
/// to at least 2x2 so the solver never sees a degenerate 1x1 problem.
fn cost_matrix<F>(
    tracks: &[&TrackNode],
    detections: &[Detection],
    cfg: &AssociationSection,
    meas_cov: &F,
) -> Matrix<f64>
where
    F: Fn(&str) -> MeasMatrix,
{
    let dims = tracks.len().max(detections.len()).max(2);
    Matrix::from_shape_fn((dims, dims), |(i, j)| {
        if i >= tracks.len() || j >= detections.len() {
            return GATED_COST;
        }
        pair_cost(tracks[i], &detections[j], cfg, meas_cov).unwrap_or(GATED_COST)
    })
}

/// Associate detections to tracks.
///
/// `tracks` must be in ascending `track_id` order; stage 2 depends on
/// it and the caller's ordered table provides it for free.
pub fn associate<F>(
    tracks: &[&TrackNode],
    detections: &[Detection],
    cfg: &AssociationSection,
    meas_cov: F,
) -> Association
where
    F: Fn(&str) -> MeasMatrix,
{
    let mut result = Association {
        matches: Vec::new(),
        unmatched_tracks: tracks.iter().map(|t| t.track_id).collect(),
        unmatched_detections: (0..detections.len()).collect(),
    };
    if tracks.is_empty() || detections.is_empty() {
        return result;
    }

    // Stage 1: global minimum-cost assignment, then strip out every
    // pairing the gates had already forbidden.
    let costs = cost_matrix(tracks, detections, cfg, &meas_cov);
    let assigned_columns = match lapjv(&costs) {
        Ok((row_solution, _)) => row_solution,
        Err(err) => {
            warn!("assignment solver failed: {err:?}; skipping first-stage matches");
            Vec::new()
        }
    };

    let mut matched_tracks = vec![false; tracks.len()];
    let mut matched_detections = vec![false; detections.len()];
    for (i, &j) in assigned_columns.iter().enumerate().take(tracks.len()) {
        if j >= detections.len() || costs[(i, j)] >= GATE_REJECT_COST {
            continue;
        }
        result.matches.push((tracks[i].track_id, j));
        matched_tracks[i] = true;
        matched_detections[j] = true;
    }

    // Stage 2: greedy center-distance rescue over the leftovers, in
    // track-id order. Each detection may be claimed once; ties keep
    // the first candidate seen.
    for (i, track) in tracks.iter().enumerate() {
        if matched_tracks[i] {
            continue;
        }
        let mut best: Option<usize> = None;
        let mut best_distance = f64::INFINITY;
        for (j, detection) in detections.iter().enumerate() {
            if matched_detections[j] || detection.label != track.label {
                continue;
            }
            let dx = detection.x - track.filter.x[0];
            let dy = detection.y - track.filter.x[1];
            let distance = (dx * dx + dy * dy).sqrt();
            if distance <= cfg.second_stage_center_gate_m && distance < best_distance {
                best_distance = distance;
                best = Some(j);
            }
        }
        if let Some(j) = best {
            result.matches.push((track.track_id, j));
            matched_tracks[i] = true;
            matched_detections[j] = true;
        }
    }

    result.unmatched_tracks = tracks
        .iter()
        .enumerate()
        .filter(|(i, _)| !matched_tracks[*i])
        .map(|(_, t)| t.track_id)
        .collect();
    result.unmatched_detections = (0..detections.len())
        .filter(|j| !matched_detections[*j])
        .collect();
    result
}
