//! Wire-facing data model: detections in, track rows out.

use serde::{Deserialize, Serialize};

use crate::imm::{MeasVector, StateVector};
use crate::track::{TrackNode, TrackStatus};

/// A single 3D detection in the common world frame.
///
/// Immutable once constructed; the ingest layer wraps yaw into
/// (-pi, pi] and rejects non-finite fields before detections reach the
/// tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    /// Center position, metres.
    pub x: f64,
    pub y: f64,
    pub z: f64,
    /// Heading about the vertical axis, radians in (-pi, pi].
    pub yaw: f64,
    /// Extent along the forward axis, metres.
    pub l: f64,
    /// Extent across the forward axis, metres.
    pub w: f64,
    /// Vertical extent, metres.
    pub h: f64,
    /// Detector confidence in [0, 1].
    pub score: f64,
    /// Class label, e.g. "car".
    pub label: String,
}

impl Detection {
    /// The 7-dim measurement vector `(x, y, z, yaw, l, w, h)`.
    pub fn measurement(&self) -> MeasVector {
        MeasVector::from([self.x, self.y, self.z, self.yaw, self.l, self.w, self.h])
    }

    /// Promote to a 9-state with zero velocity and turn rate, for BEV
    /// IoU against a track's fused state.
    pub fn as_state(&self) -> StateVector {
        StateVector::from([
            self.x, self.y, self.z, 0.0, self.yaw, 0.0, self.l, self.w, self.h,
        ])
    }
}

/// All detections sharing one frame timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameDetections {
    pub timestamp_s: f64,
    #[serde(default)]
    pub detections: Vec<Detection>,
}

/// One emitted row: the fused kinematic and extent state of a
/// confirmed or lost track at the end of a step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackOutput {
    pub track_id: u64,
    pub label: String,
    /// Smoothed existence score, clamped to [0, 1].
    pub score: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub v: f64,
    pub yaw: f64,
    pub yaw_rate: f64,
    pub l: f64,
    pub w: f64,
    pub h: f64,
    pub age_s: f64,
    pub hits: u32,
    pub status: TrackStatus,
}

impl TrackOutput {
    /// Snapshot a track's fused state into an output row.
    pub fn from_node(node: &TrackNode) -> Self {
        let x = &node.filter.x;
        Self {
            track_id: node.track_id,
            label: node.label.clone(),
            score: node.score_ema.clamp(0.0, 1.0),
            x: x[0],
            y: x[1],
            z: x[2],
            v: x[3],
            yaw: x[4],
            yaw_rate: x[5],
            l: x[6],
            w: x[7],
            h: x[8],
            age_s: node.age_s,
            hits: node.hits,
            status: node.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_detection() -> Detection {
        Detection {
            x: 10.0,
            y: -2.0,
            z: 0.5,
            yaw: 0.3,
            l: 4.0,
            w: 2.0,
            h: 1.5,
            score: 0.9,
            label: "car".to_string(),
        }
    }

    #[test]
    fn measurement_vector_layout() {
        let z = sample_detection().measurement();
        assert_eq!(
            z.as_slice(),
            &[10.0, -2.0, 0.5, 0.3, 4.0, 2.0, 1.5]
        );
    }

    #[test]
    fn state_promotion_zeroes_kinematics() {
        let x = sample_detection().as_state();
        assert_eq!(x[3], 0.0);
        assert_eq!(x[5], 0.0);
        assert_eq!(x[4], 0.3);
        assert_eq!(x[6], 4.0);
    }

    #[test]
    fn detection_parses_from_json() {
        let json = r#"{"x":1.0,"y":2.0,"z":0.0,"yaw":0.1,"l":4.0,"w":2.0,"h":1.5,"score":0.8,"label":"truck"}"#;
        let det: Detection = serde_json::from_str(json).unwrap();
        assert_eq!(det.label, "truck");
        assert_eq!(det.score, 0.8);
    }

    #[test]
    fn frame_detections_default_to_empty() {
        let json = r#"{"timestamp_s": 1.5}"#;
        let frame: FrameDetections = serde_json::from_str(json).unwrap();
        assert!(frame.detections.is_empty());
    }
}
