//! Per-track record and the lifecycle status machine.

use serde::{Deserialize, Serialize};

use crate::imm::ImmEkf;

/// Lifecycle phase of a track.
///
/// ```text
/// tentative --matched, enough hits, enough score--> confirmed
/// tentative --any miss--> deleted
/// confirmed --unmatched this frame--> lost
/// lost      --matched--> confirmed
/// any       --stale or score floor--> deleted
/// ```
///
/// Only confirmed and lost tracks are ever emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackStatus {
    Tentative,
    Confirmed,
    Lost,
}

/// One tracked object: identity, class, filter, and lifecycle
/// counters. Owned exclusively by the tracker's id-keyed table and
/// mutated only there.
#[derive(Debug, Clone)]
pub struct TrackNode {
    /// Monotonic id, unique within a tracker instance.
    pub track_id: u64,
    /// Class label; fixed at spawn.
    pub label: String,
    pub filter: ImmEkf,
    /// EMA-smoothed existence score.
    pub score_ema: f64,
    /// Total matched updates; at least 1 for any live track.
    pub hits: u32,
    /// Frames missed since the last update.
    pub misses: u32,
    /// Seconds since spawn.
    pub age_s: f64,
    /// Seconds since the last matched update.
    pub time_since_update_s: f64,
    pub status: TrackStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serialises_lowercase() {
        assert_eq!(
            serde_json::to_string(&TrackStatus::Confirmed).unwrap(),
            "\"confirmed\""
        );
        assert_eq!(
            serde_json::from_str::<TrackStatus>("\"lost\"").unwrap(),
            TrackStatus::Lost
        );
    }
}
