//! Album-level aggregation on top of one [`Meter`] per track.
//!
//! Runs after all of an album's workers have joined (spec §5); reads
//! finished [`Meter`] state as immutable data and never mutates it.

use crate::meter::{loudness_global_multiple, Meter};

/// ReplayGain reference level for this system (ReplayGain 2.0 style).
pub const REFERENCE_LUFS: f64 = -18.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainData {
    pub track_gain_db: f64,
    pub track_peak: f64,
    pub album_mode: bool,
    pub album_gain_db: f64,
    pub album_peak: f64,
}

/// Converts an integrated-loudness measurement to a ReplayGain value.
/// NaN loudness (no gated blocks, e.g. silence) maps to `-REFERENCE_LUFS`
/// so that silent tracks do not crash tagging.
pub fn loudness_to_gain(loudness_lufs: f64) -> f64 {
    if loudness_lufs.is_nan() {
        -REFERENCE_LUFS
    } else {
        REFERENCE_LUFS - loudness_lufs
    }
}

/// Track-only gain data: no album context.
pub fn track_gain(meter: &Meter) -> GainData {
    let loudness = meter.loudness_global();
    GainData {
        track_gain_db: loudness_to_gain(loudness),
        track_peak: meter.max_sample_peak(),
        album_mode: false,
        album_gain_db: 0.0,
        album_peak: 0.0,
    }
}

/// Album gain data: combines block lists across `meters` (spec §4.2), and
/// pairs it with each track's own (already-known) track gain. Album-level
/// loudness range is not part of `GainData` (the spec's data model has no
/// slot for it); callers that want it call `meter::loudness_range_multiple`
/// directly, the same combinator this function uses for loudness.
pub fn album_gain(meters: &[&Meter], track_gains: &[GainData]) -> GainData {
    let album_loudness = loudness_global_multiple(meters.iter().copied());
    let album_peak = meters.iter().map(|m| m.max_sample_peak()).fold(0.0, f64::max);
    let album_gain_db = loudness_to_gain(album_loudness);

    GainData {
        album_mode: true,
        album_gain_db,
        album_peak,
        // placeholders; per-track values are merged in by the caller
        track_gain_db: track_gains.first().map(|g| g.track_gain_db).unwrap_or(0.0),
        track_peak: track_gains.first().map(|g| g.track_peak).unwrap_or(0.0),
    }
}

/// Merges an album-level result onto each track's own gain data.
pub fn merge_album_into_track(track: GainData, album: &GainData) -> GainData {
    GainData {
        track_gain_db: track.track_gain_db,
        track_peak: track.track_peak,
        album_mode: true,
        album_gain_db: album.album_gain_db,
        album_peak: album.album_peak,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meter::Mode;

    #[test]
    fn silence_maps_to_positive_reference_gain() {
        assert_eq!(loudness_to_gain(f64::NAN), 18.0);
    }

    #[test]
    fn minus_twenty_lufs_yields_plus_two_db() {
        let gain = loudness_to_gain(-20.0);
        assert!((gain - 2.0).abs() < 1e-9);
    }

    #[test]
    fn album_combines_two_tracks() {
        let mut a = Meter::new(1, 48000, Mode::I).unwrap();
        let mut b = Meter::new(1, 48000, Mode::I).unwrap();
        a.add_frames(&vec![0.3f64; 48000 * 2]);
        b.add_frames(&vec![0.1f64; 48000 * 2]);
        let ta = track_gain(&a);
        let tb = track_gain(&b);
        let album = album_gain(&[&a, &b], &[ta, tb]);
        assert!(album.album_gain_db.is_finite());
    }
}
