//! The tracking engine: owns every live track and advances them one
//! timestamped frame at a time.
//!
//! Per frame: predict all tracks to the frame time, associate the
//! detections, update the matched filters, miss-mark the rest, spawn
//! tentative tracks from strong leftover detections, retire stale or
//! faded tracks, and emit the confirmed/lost survivors. `step` is the
//! only mutation entry point; the tracker is a plain value and callers
//! that need independent scenes instantiate one tracker per scene.

use std::collections::BTreeMap;

use nalgebra::{Matrix2, Vector2};
use tracing::debug;

use crate::association::{associate, Association};
use crate::config::{LabelTable, TrackerConfig};
use crate::error::TrackError;
use crate::imm::{ImmEkf, MeasMatrix, StateMatrix, StateVector, MIN_EXTENT_M};
use crate::track::{TrackNode, TrackStatus};
use crate::types::{Detection, TrackOutput};

/// Floor applied to inter-frame gaps, seconds. Out-of-order or
/// duplicate timestamps degrade to a tiny forward step instead of a
/// rewind.
const MIN_DT_S: f64 = 1e-3;
/// Score EMA blend on a matched update: keep 0.6 of history, take 0.4
/// of the detection score.
const SCORE_EMA_KEEP: f64 = 0.6;
const SCORE_EMA_TAKE: f64 = 0.4;
/// Tracks whose score EMA falls below this are deleted outright.
const SCORE_DELETE_FLOOR: f64 = 0.05;
/// Standard deviations of a newborn track's diagonal covariance:
/// position, speed, yaw, yaw rate, extents.
const INIT_STATE_STD: [f64; 9] = [6.0, 6.0, 3.0, 4.0, 0.8, 0.8, 1.0, 1.0, 1.0];

/// Online multi-object tracker over timestamped 3D detections.
///
/// Strictly single-threaded and synchronous; `step` must be called in
/// monotonic-timestamp order per instance. All tracks are owned by the
/// id-keyed table, which iterates in ascending id order so association
/// and emission are deterministic.
#[derive(Debug)]
pub struct Tracker {
    config: TrackerConfig,
    q_cv: StateMatrix,
    q_ctrv: StateMatrix,
    transition: Matrix2<f64>,
    mode_prob_init: Vector2<f64>,
    min_hits: LabelTable<u32>,
    max_age_s: LabelTable<f64>,
    meas_cov: LabelTable<MeasMatrix>,
    tracks: BTreeMap<u64, TrackNode>,
    next_id: u64,
    last_timestamp_s: Option<f64>,
}

impl Tracker {
    /// Build a tracker from a validated configuration. Derived
    /// quantities (noise covariances, label tables, mode priors) are
    /// resolved once here.
    pub fn new(config: TrackerConfig) -> Result<Self, TrackError> {
        config.validate()?;
        let q_cv = config.noise.q_cv();
        let q_ctrv = config.noise.q_ctrv();
        let transition = config.imm.transition_matrix();
        let mode_prob_init = config.imm.initial_mode_probabilities();
        let min_hits = config.tracker.min_hits_table()?;
        let max_age_s = config.tracker.max_age_table()?;
        let meas_cov = config.noise.meas_cov_table()?;

        Ok(Self {
            config,
            q_cv,
            q_ctrv,
            transition,
            mode_prob_init,
            min_hits,
            max_age_s,
            meas_cov,
            tracks: BTreeMap::new(),
            next_id: 1,
            last_timestamp_s: None,
        })
    }

    /// Number of live tracks (any status).
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Live tracks in ascending id order.
    pub fn tracks(&self) -> impl Iterator<Item = &TrackNode> {
        self.tracks.values()
    }

    /// Advance the tracker by one frame and return the emitted rows.
    ///
    /// Emits every surviving confirmed or lost track, sorted by
    /// `(track_id, label)`; tentative tracks are never emitted.
    pub fn step(
        &mut self,
        timestamp_s: f64,
        detections: &[Detection],
    ) -> Result<Vec<TrackOutput>, TrackError> {
        if !timestamp_s.is_finite() {
            return Err(TrackError::Input(format!(
                "non-finite frame timestamp {timestamp_s}"
            )));
        }

        let dt = self.compute_dt(timestamp_s);
        self.predict_all(dt);

        let association = self.associate_frame(detections);
        self.update_matched(&association.matches, detections);
        self.mark_missed(&association.unmatched_tracks);
        let spawned = self.spawn_tracks(&association.unmatched_detections, detections);
        let retired = self.retire_tracks();

        self.last_timestamp_s = Some(timestamp_s);
        self.audit_invariants()?;

        let outputs = self.emit_outputs();
        debug!(
            timestamp_s,
            dt,
            detections = detections.len(),
            matches = association.matches.len(),
            spawned,
            retired,
            live = self.tracks.len(),
            emitted = outputs.len(),
            "step complete"
        );
        Ok(outputs)
    }

    fn compute_dt(&self, timestamp_s: f64) -> f64 {
        match self.last_timestamp_s {
            Some(previous) => (timestamp_s - previous).max(MIN_DT_S),
            None => self.config.tracker.dt_fallback_s,
        }
    }

    /// Project every live track to the frame time. The existence score
    /// decays here, before association; a matched track then recovers
    /// part of it through the score EMA.
    fn predict_all(&mut self, dt: f64) {
        let decay = self.config.tracker.existence_decay;
        let (q_cv, q_ctrv) = (self.q_cv, self.q_ctrv);
        for track in self.tracks.values_mut() {
            track.filter.predict(dt, &q_cv, &q_ctrv);
            track.age_s += dt;
            track.time_since_update_s += dt;
            track.score_ema *= decay;
        }
    }

    fn associate_frame(&self, detections: &[Detection]) -> Association {
        let track_refs: Vec<&TrackNode> = self.tracks.values().collect();
        associate(
            &track_refs,
            detections,
            &self.config.association,
            |label| self.meas_cov.get(label),
        )
    }

    fn update_matched(&mut self, matches: &[(u64, usize)], detections: &[Detection]) {
        for &(track_id, det_idx) in matches {
            let detection = &detections[det_idx];
            // The label gate guarantees detection and track labels agree.
            let r = self.meas_cov.get(&detection.label);
            let min_hits = self.min_hits.get(&detection.label);
            let confirm_threshold = self.config.tracker.confirm_score_threshold;

            let Some(track) = self.tracks.get_mut(&track_id) else {
                continue;
            };
            track.filter.update(&detection.measurement(), &r);
            track.hits += 1;
            track.misses = 0;
            track.time_since_update_s = 0.0;
            track.score_ema =
                SCORE_EMA_KEEP * track.score_ema + SCORE_EMA_TAKE * detection.score;

            match track.status {
                TrackStatus::Tentative
                    if track.hits >= min_hits && track.score_ema >= confirm_threshold =>
                {
                    track.status = TrackStatus::Confirmed;
                }
                TrackStatus::Lost => {
                    track.status = TrackStatus::Confirmed;
                }
                _ => {}
            }
        }
    }

    fn mark_missed(&mut self, unmatched_tracks: &[u64]) {
        for track_id in unmatched_tracks {
            if let Some(track) = self.tracks.get_mut(track_id) {
                track.misses += 1;
                if track.status == TrackStatus::Confirmed {
                    track.status = TrackStatus::Lost;
                }
            }
        }
    }

    fn spawn_tracks(&mut self, unmatched_detections: &[usize], detections: &[Detection]) -> usize {
        let mut spawned = 0;
        for &det_idx in unmatched_detections {
            let detection = &detections[det_idx];
            if detection.score < self.config.tracker.init_score_threshold {
                continue;
            }
            let node = self.init_track(detection);
            self.tracks.insert(node.track_id, node);
            spawned += 1;
        }
        spawned
    }

    fn init_track(&mut self, detection: &Detection) -> TrackNode {
        let x0 = StateVector::from([
            detection.x,
            detection.y,
            detection.z,
            0.0,
            detection.yaw,
            0.0,
            detection.l.max(MIN_EXTENT_M),
            detection.w.max(MIN_EXTENT_M),
            detection.h.max(MIN_EXTENT_M),
        ]);
        let p0 = StateMatrix::from_diagonal(&StateVector::from(INIT_STATE_STD.map(|s| s * s)));
        let filter = ImmEkf::new(x0, p0, self.mode_prob_init, self.transition);

        let track_id = self.next_id;
        self.next_id += 1;
        TrackNode {
            track_id,
            label: detection.label.clone(),
            filter,
            score_ema: detection.score,
            hits: 1,
            misses: 0,
            age_s: 0.0,
            time_since_update_s: 0.0,
            status: TrackStatus::Tentative,
        }
    }

    /// Delete tracks that are stale, tentative-with-a-miss, or faded.
    fn retire_tracks(&mut self) -> usize {
        let doomed: Vec<u64> = self
            .tracks
            .values()
            .filter(|track| {
                track.time_since_update_s > self.max_age_s.get(&track.label)
                    || (track.status == TrackStatus::Tentative && track.misses > 0)
                    || track.score_ema < SCORE_DELETE_FLOOR
            })
            .map(|track| track.track_id)
            .collect();
        for track_id in &doomed {
            self.tracks.remove(track_id);
        }
        doomed.len()
    }

    /// Abort the run when a track emerges from a step in an impossible
    /// state.
    fn audit_invariants(&self) -> Result<(), TrackError> {
        for track in self.tracks.values() {
            let context = format!(
                "track {} ({}, {:?})",
                track.track_id, track.label, track.status
            );
            if track.filter.x.iter().any(|v| !v.is_finite()) {
                return Err(TrackError::Invariant(format!(
                    "{context}: non-finite state {:?}",
                    track.filter.x
                )));
            }
            if track.filter.p.iter().any(|v| !v.is_finite()) {
                return Err(TrackError::Invariant(format!(
                    "{context}: non-finite covariance"
                )));
            }
            let mu = track.filter.mode_probabilities();
            if mu.iter().any(|m| *m < 0.0) || (mu.sum() - 1.0).abs() > 1e-6 {
                return Err(TrackError::Invariant(format!(
                    "{context}: mode probabilities off the simplex: {mu:?}"
                )));
            }
            if track.hits == 0 {
                return Err(TrackError::Invariant(format!(
                    "{context}: live track without a hit"
                )));
            }
        }
        Ok(())
    }

    fn emit_outputs(&self) -> Vec<TrackOutput> {
        let mut outputs: Vec<TrackOutput> = self
            .tracks
            .values()
            .filter(|track| {
                matches!(track.status, TrackStatus::Confirmed | TrackStatus::Lost)
            })
            .map(TrackOutput::from_node)
            .collect();
        outputs.sort_by(|a, b| {
            (a.track_id, a.label.as_str()).cmp(&(b.track_id, b.label.as_str()))
        });
        outputs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn car(x: f64, y: f64, score: f64) -> Detection {
        Detection {
            x,
            y,
            z: 0.0,
            yaw: 0.0,
            l: 4.0,
            w: 2.0,
            h: 1.5,
            score,
            label: "car".to_string(),
        }
    }

    fn truck(x: f64, y: f64, score: f64) -> Detection {
        Detection {
            label: "truck".to_string(),
            ..car(x, y, score)
        }
    }

    /// Confirmation after three hits, fast decay, short staleness
    /// budget; shared by the end-to-end scenarios.
    fn scenario_config() -> TrackerConfig {
        let mut cfg = TrackerConfig::default();
        cfg.tracker.min_hits = HashMap::from([("default".to_string(), 3)]);
        cfg.tracker.confirm_score_threshold = 0.4;
        cfg.tracker.init_score_threshold = 0.3;
        cfg.tracker.existence_decay = 0.9;
        cfg.tracker.max_age_s = HashMap::from([("default".to_string(), 0.5)]);
        cfg
    }

    fn confirm_single_car(tracker: &mut Tracker) {
        for (i, t) in [0.0, 0.1, 0.2].into_iter().enumerate() {
            let outputs = tracker.step(t, &[car(10.0, 0.0, 0.9)]).unwrap();
            if i < 2 {
                assert!(outputs.is_empty(), "tentative tracks must not be emitted");
            }
        }
    }

    #[test]
    fn single_object_confirms_after_three_hits() {
        let mut tracker = Tracker::new(scenario_config()).unwrap();
        confirm_single_car(&mut tracker);

        let outputs = tracker.step(0.3, &[car(10.0, 0.0, 0.9)]).unwrap();
        assert_eq!(outputs.len(), 1);
        let out = &outputs[0];
        assert_eq!(out.track_id, 1);
        assert_eq!(out.status, TrackStatus::Confirmed);
        assert_eq!(out.hits, 4);
        assert!((out.x - 10.0).abs() < 0.2);
        assert!(out.y.abs() < 0.2);

        // Third frame already confirmed with exactly three hits.
        let mut fresh = Tracker::new(scenario_config()).unwrap();
        let mut last = Vec::new();
        for t in [0.0, 0.1, 0.2] {
            last = fresh.step(t, &[car(10.0, 0.0, 0.9)]).unwrap();
        }
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].hits, 3);
        assert_eq!(last[0].status, TrackStatus::Confirmed);
    }

    #[test]
    fn lost_track_recovers_with_its_id() {
        let mut tracker = Tracker::new(scenario_config()).unwrap();
        confirm_single_car(&mut tracker);

        // Empty frame: confirmed goes lost but is still emitted.
        let outputs = tracker.step(0.3, &[]).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].status, TrackStatus::Lost);
        assert_eq!(outputs[0].track_id, 1);

        // A nearby detection brings it straight back to confirmed.
        let outputs = tracker.step(0.4, &[car(10.04, 0.0, 0.9)]).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].track_id, 1);
        assert_eq!(outputs[0].status, TrackStatus::Confirmed);
        assert_eq!(outputs[0].hits, 4);
        assert_eq!(tracker.track_count(), 1);
    }

    #[test]
    fn stale_track_is_retired() {
        let mut tracker = Tracker::new(scenario_config()).unwrap();
        confirm_single_car(&mut tracker);

        // Gap still inside the 0.5 s budget: emitted as lost.
        let outputs = tracker.step(0.5, &[]).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].status, TrackStatus::Lost);

        // Gap beyond the budget: gone from the emitted list and the table.
        let outputs = tracker.step(0.8, &[]).unwrap();
        assert!(outputs.is_empty());
        assert_eq!(tracker.track_count(), 0);

        let outputs = tracker.step(0.9, &[]).unwrap();
        assert!(outputs.is_empty());
    }

    #[test]
    fn tentative_track_dies_on_first_miss() {
        let mut tracker = Tracker::new(scenario_config()).unwrap();
        let outputs = tracker.step(0.0, &[car(5.0, 5.0, 0.35)]).unwrap();
        assert!(outputs.is_empty());
        assert_eq!(tracker.track_count(), 1);

        let outputs = tracker.step(0.1, &[]).unwrap();
        assert!(outputs.is_empty());
        assert_eq!(tracker.track_count(), 0);
    }

    #[test]
    fn weak_detection_never_spawns() {
        let mut tracker = Tracker::new(scenario_config()).unwrap();
        tracker.step(0.0, &[car(5.0, 5.0, 0.2)]).unwrap();
        assert_eq!(tracker.track_count(), 0);
    }

    #[test]
    fn crossing_objects_keep_their_ids() {
        let mut tracker = Tracker::new(scenario_config()).unwrap();
        // A car and a truck drive through each other head-on; the label
        // gate forbids any cross-class association.
        let mut last = Vec::new();
        for k in 0..7 {
            let t = k as f64 * 0.1;
            let car_x = k as f64;
            let truck_x = 6.0 - k as f64;
            last = tracker
                .step(t, &[car(car_x, 0.0, 0.9), truck(truck_x, 0.0, 0.9)])
                .unwrap();
        }
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].track_id, 1);
        assert_eq!(last[0].label, "car");
        assert!((last[0].x - 6.0).abs() < 1.0);
        assert_eq!(last[1].track_id, 2);
        assert_eq!(last[1].label, "truck");
        assert!(last[1].x.abs() < 1.0);
    }

    #[test]
    fn center_gate_rescues_an_overshoot() {
        let mut cfg = scenario_config();
        // Tight Mahalanobis gate so a 2.5 m jump fails stage 1; wide
        // center gate so stage 2 recovers it.
        cfg.association.maha_gate_threshold = 5.0;
        cfg.association.second_stage_center_gate_m = 3.0;
        let mut tracker = Tracker::new(cfg).unwrap();
        confirm_single_car(&mut tracker);

        let outputs = tracker.step(0.3, &[car(12.5, 0.0, 0.9)]).unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].track_id, 1, "rescue must preserve the id");
        assert_eq!(outputs[0].status, TrackStatus::Confirmed);
        assert_eq!(outputs[0].hits, 4);
        assert_eq!(tracker.track_count(), 1, "no duplicate track may spawn");
    }

    #[test]
    fn track_ids_are_monotonic_and_never_reused() {
        let mut tracker = Tracker::new(scenario_config()).unwrap();
        tracker.step(0.0, &[car(0.0, 0.0, 0.9)]).unwrap();
        // Tentative dies on the miss, freeing nothing: the next spawn
        // takes a fresh id.
        tracker.step(0.1, &[]).unwrap();
        tracker.step(0.2, &[car(50.0, 0.0, 0.9)]).unwrap();

        let ids: Vec<u64> = tracker.tracks().map(|t| t.track_id).collect();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn repeated_or_rewound_timestamps_floor_the_gap() {
        let mut tracker = Tracker::new(scenario_config()).unwrap();
        tracker.step(7.0, &[car(0.0, 0.0, 0.9)]).unwrap();

        // A repeated timestamp floors to the minimal forward step.
        tracker.step(7.0, &[car(0.0, 0.0, 0.9)]).unwrap();
        let ages: Vec<f64> = tracker.tracks().map(|t| t.age_s).collect();
        assert!((ages[0] - 1e-3).abs() < 1e-12);

        // So does a timestamp that moves backwards.
        tracker.step(6.5, &[car(0.0, 0.0, 0.9)]).unwrap();
        let ages: Vec<f64> = tracker.tracks().map(|t| t.age_s).collect();
        assert!((ages[0] - 2e-3).abs() < 1e-12);
    }

    #[test]
    fn replay_is_deterministic() {
        let frames: Vec<(f64, Vec<Detection>)> = vec![
            (0.0, vec![car(0.0, 0.0, 0.9), truck(20.0, 5.0, 0.8)]),
            (0.1, vec![car(0.5, 0.1, 0.85), truck(19.5, 5.2, 0.82)]),
            (0.2, vec![truck(19.0, 5.4, 0.81)]),
            (0.3, vec![car(1.4, 0.2, 0.9), truck(18.6, 5.5, 0.8)]),
            (0.4, vec![car(1.9, 0.3, 0.88)]),
        ];

        let run = |frames: &[(f64, Vec<Detection>)]| -> Vec<Vec<TrackOutput>> {
            let mut tracker = Tracker::new(scenario_config()).unwrap();
            frames
                .iter()
                .map(|(t, dets)| tracker.step(*t, dets).unwrap())
                .collect()
        };

        assert_eq!(run(&frames), run(&frames));
    }

    #[test]
    fn non_finite_timestamp_is_rejected() {
        let mut tracker = Tracker::new(scenario_config()).unwrap();
        assert!(matches!(
            tracker.step(f64::NAN, &[]),
            Err(TrackError::Input(_))
        ));
    }
}
