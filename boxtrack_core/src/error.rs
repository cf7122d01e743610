//! Error taxonomy for the tracking engine.

/// Errors surfaced by configuration, ingest, and the tracker core.
///
/// `Config` and `Input` abort a run at ingest. `Numeric` is reported by
/// filter queries whose innovation covariance stays singular even after
/// jittering; callers recover by treating the affected pairing as
/// ungated. `Invariant` means a track emerged from a step in an
/// impossible state and is fatal.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TrackError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    Input(String),

    #[error("numerical failure: {0}")]
    Numeric(String),

    #[error("invariant violation: {0}")]
    Invariant(String),
}
