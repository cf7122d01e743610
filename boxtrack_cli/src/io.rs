//! Detection-file ingest and track-file output.
//!
//! Ingest is where malformed input dies: non-finite fields and
//! out-of-range scores are rejected before anything reaches the
//! tracker, yaw is wrapped into (-pi, pi], and frames are sorted by
//! timestamp so replay order never depends on file order.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use boxtrack_core::math::wrap_angle;
use boxtrack_core::{Detection, FrameDetections, TrackError, TrackOutput};

#[derive(Debug, Deserialize)]
struct DetectionFile {
    frames: Vec<FrameDetections>,
}

/// One output row: a track state stamped with its frame time.
#[derive(Debug, Serialize)]
pub struct TrackRow {
    #[serde(flatten)]
    pub output: TrackOutput,
    pub timestamp_s: f64,
}

#[derive(Debug, Serialize)]
struct TrackFile {
    tracks: Vec<TrackRow>,
}

fn input_err(path: &Path, message: impl std::fmt::Display) -> TrackError {
    TrackError::Input(format!("{}: {message}", path.display()))
}

fn validate_detection(detection: &Detection) -> Result<(), String> {
    let fields = [
        ("x", detection.x),
        ("y", detection.y),
        ("z", detection.z),
        ("yaw", detection.yaw),
        ("l", detection.l),
        ("w", detection.w),
        ("h", detection.h),
        ("score", detection.score),
    ];
    for (name, value) in fields {
        if !value.is_finite() {
            return Err(format!("detection field {name} is not finite ({value})"));
        }
    }
    if !(0.0..=1.0).contains(&detection.score) {
        return Err(format!("detection score {} outside [0, 1]", detection.score));
    }
    Ok(())
}

/// Load, sanitise, and time-sort the detection frames.
pub fn load_frames(path: &Path) -> Result<Vec<FrameDetections>, TrackError> {
    let text = fs::read_to_string(path).map_err(|e| input_err(path, e))?;
    let file: DetectionFile =
        serde_json::from_str(&text).map_err(|e| input_err(path, e))?;

    let mut frames = file.frames;
    for frame in &mut frames {
        if !frame.timestamp_s.is_finite() {
            return Err(input_err(path, "frame timestamp is not finite"));
        }
        for detection in &mut frame.detections {
            validate_detection(detection).map_err(|message| input_err(path, message))?;
            detection.yaw = wrap_angle(detection.yaw);
        }
    }
    frames.sort_by(|a, b| a.timestamp_s.total_cmp(&b.timestamp_s));
    Ok(frames)
}

/// Write the collected rows as `{"tracks": [...]}`.
pub fn save_tracks(path: &Path, rows: Vec<TrackRow>) -> std::io::Result<()> {
    let file = TrackFile { tracks: rows };
    let text = serde_json::to_string_pretty(&file)?;
    fs::write(path, text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;
    use std::io::Write as _;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn frames_are_sorted_and_yaw_is_wrapped() {
        let file = write_temp(
            r#"{"frames": [
                {"timestamp_s": 0.2, "detections": []},
                {"timestamp_s": 0.1, "detections": [
                    {"x": 1.0, "y": 2.0, "z": 0.0, "yaw": 7.0,
                     "l": 4.0, "w": 2.0, "h": 1.5, "score": 0.9, "label": "car"}
                ]}
            ]}"#,
        );
        let frames = load_frames(file.path()).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].timestamp_s, 0.1);
        let yaw = frames[0].detections[0].yaw;
        assert!(yaw > -PI && yaw <= PI);
        assert!((yaw - (7.0 - 2.0 * PI)).abs() < 1e-12);
    }

    #[test]
    fn non_finite_field_is_rejected() {
        let detection = Detection {
            x: f64::NAN,
            y: 0.0,
            z: 0.0,
            yaw: 0.0,
            l: 4.0,
            w: 2.0,
            h: 1.5,
            score: 0.9,
            label: "car".to_string(),
        };
        let message = validate_detection(&detection).unwrap_err();
        assert!(message.contains("not finite"));
    }

    #[test]
    fn out_of_range_score_is_rejected() {
        let file = write_temp(
            r#"{"frames": [
                {"timestamp_s": 0.0, "detections": [
                    {"x": 0.0, "y": 0.0, "z": 0.0, "yaw": 0.0,
                     "l": 4.0, "w": 2.0, "h": 1.5, "score": 1.4, "label": "car"}
                ]}
            ]}"#,
        );
        assert!(matches!(
            load_frames(file.path()),
            Err(TrackError::Input(_))
        ));
    }

    #[test]
    fn malformed_json_is_rejected() {
        let file = write_temp("{\"frames\": [");
        assert!(matches!(
            load_frames(file.path()),
            Err(TrackError::Input(_))
        ));
    }
}
