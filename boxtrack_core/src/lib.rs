//! Online multi-object tracking over 3D oriented-box detections.
//!
//! Per frame the engine predicts every live track to the frame
//! timestamp with an IMM-EKF (constant-velocity and constant-turn-rate
//! hypotheses over a shared 9-dim state), associates detections in two
//! stages (gated minimum-cost assignment, then a center-distance
//! rescue), updates the matched tracks, spawns tentative tracks from
//! strong leftover detections, and retires the stale. Confirmed and
//! lost tracks are emitted with their full kinematic and extent state.

pub mod association;
pub mod config;
pub mod error;
pub mod geometry;
pub mod imm;
pub mod math;
pub mod track;
pub mod tracker;
pub mod types;

// Re-export key types for convenience
pub use association::Association;
pub use config::TrackerConfig;
pub use error::TrackError;
pub use imm::{ImmEkf, MotionModel, MEAS_DIM, STATE_DIM};
pub use track::{TrackNode, TrackStatus};
pub use tracker::Tracker;
pub use types::{Detection, FrameDetections, TrackOutput};
