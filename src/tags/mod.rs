//! Format-dispatched Tag Writer (spec §4.4). Every format clears any
//! pre-existing ReplayGain payload before writing the freshly computed one,
//! and probes agree on the "zero peak means not tagged" rule carried over
//! from the original tool (see the per-format modules for the exact bytes).

mod ape;
mod id3;
mod mp4;
mod opus;
mod xiph;

use std::path::Path;

use crate::aggregator::GainData;
use crate::error::{Error, Result};

const GAIN_CLAMP_DB: f64 = 51.0;

/// Opus-specific tagging configuration (spec §3 `OpusTagInfo`).
#[derive(Debug, Clone, Copy)]
pub struct OpusTagInfo {
    pub vorbisgain_compat: bool,
    pub reference: OpusReference,
    pub offset_db: f64,
    pub is_track: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpusReference {
    Absolute,
    R128,
}

pub(crate) fn clamp_gain(db: f64) -> f64 {
    db.clamp(-GAIN_CLAMP_DB, GAIN_CLAMP_DB)
}

pub(crate) fn format_gain(db: f64) -> String {
    format!("{:+.2} dB", clamp_gain(db))
}

pub(crate) fn format_peak(peak: f64) -> String {
    format!("{:.6}", peak)
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default()
}

/// Writes ReplayGain tags for `path`, dispatching by extension.
/// `opus_info` is only consulted for `.opus` files.
pub fn write_tags<P: AsRef<Path>>(path: P, gain: &GainData, opus_info: Option<OpusTagInfo>) -> Result<()> {
    let path = path.as_ref();
    match extension_of(path).as_str() {
        "mp3" | "mp2" => id3::write(path, gain),
        "flac" | "ogg" | "oga" => xiph::write(path, gain),
        "opus" => opus::write(path, gain, opus_info),
        "mpc" | "wv" => ape::write(path, gain),
        "mp4" | "m4a" => mp4::write(path, gain),
        other => Err(Error::UnsupportedFormat(other.to_string())),
    }
}

/// Removes any ReplayGain payload (and, for Opus, resets the header gain to 0).
pub fn delete_tags<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    match extension_of(path).as_str() {
        "mp3" | "mp2" => id3::delete(path),
        "flac" | "ogg" | "oga" => xiph::delete(path),
        "opus" => opus::delete(path),
        "mpc" | "wv" => ape::delete(path),
        "mp4" | "m4a" => mp4::delete(path),
        other => Err(Error::UnsupportedFormat(other.to_string())),
    }
}

/// True iff `path` already carries a non-placeholder ReplayGain payload.
/// A peak value of exactly `0` is treated as "not tagged" (spec §4.4
/// has_tag probe), forcing a re-scan of files tagged by tools that wrote a
/// placeholder zero peak. Applies uniformly across all five formats.
pub fn has_tag<P: AsRef<Path>>(path: P) -> Result<bool> {
    let path = path.as_ref();
    match extension_of(path).as_str() {
        "mp3" | "mp2" => id3::has_tag(path),
        "flac" | "ogg" | "oga" => xiph::has_tag(path),
        "opus" => opus::has_tag(path),
        "mpc" | "wv" => ape::has_tag(path),
        "mp4" | "m4a" => mp4::has_tag(path),
        other => Err(Error::UnsupportedFormat(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_gain_keeps_sign_and_precision() {
        assert_eq!(format_gain(2.0), "+2.00 dB");
        assert_eq!(format_gain(-3.456), "-3.46 dB");
    }

    #[test]
    fn format_gain_clamps() {
        assert_eq!(format_gain(100.0), "+51.00 dB");
        assert_eq!(format_gain(-100.0), "-51.00 dB");
    }

    #[test]
    fn format_peak_has_six_decimals() {
        assert_eq!(format_peak(0.5), "0.500000");
    }
}
