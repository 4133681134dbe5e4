//! APEv2 tag writer for WavPack (`.wv`) and Musepack (`.mpc`), via `lofty`'s
//! generic `ItemKey` mapping (spec §4.4). Key comparison is case-insensitive
//! per APE convention; `lofty` already folds keys for us.

use std::path::Path;

use lofty::{ItemKey, Probe, TagExt, TaggedFileExt};

use super::{format_gain, format_peak};
use crate::aggregator::GainData;
use crate::error::{Error, Result};

fn read_err(path: &Path, e: impl std::error::Error + Send + Sync + 'static) -> Error {
    Error::TagReadFailed { path: path.display().to_string(), source: Box::new(e) }
}

fn write_err(path: &Path, e: impl std::error::Error + Send + Sync + 'static) -> Error {
    Error::TagWriteFailed { path: path.display().to_string(), source: Box::new(e) }
}

fn parse_value(raw: &str) -> Option<f64> {
    let s = raw.trim();
    let s = s.strip_suffix("dB").map(str::trim).unwrap_or(s);
    s.parse::<f64>().ok()
}

pub fn write(path: &Path, gain: &GainData) -> Result<()> {
    let mut tagged_file = Probe::open(path).map_err(|e| read_err(path, e))?.read().map_err(|e| read_err(path, e))?;
    let tag_type = tagged_file.primary_tag_type();
    if tagged_file.tag(tag_type).is_none() {
        tagged_file.insert_tag(lofty::Tag::new(tag_type));
    }
    let tag = tagged_file.tag_mut(tag_type).expect("tag inserted above");

    tag.insert_text(ItemKey::ReplayGainTrackGain, format_gain(gain.track_gain_db));
    tag.insert_text(ItemKey::ReplayGainTrackPeak, format_peak(gain.track_peak));
    if gain.album_mode {
        tag.insert_text(ItemKey::ReplayGainAlbumGain, format_gain(gain.album_gain_db));
        tag.insert_text(ItemKey::ReplayGainAlbumPeak, format_peak(gain.album_peak));
    } else {
        tag.remove_key(&ItemKey::ReplayGainAlbumGain);
        tag.remove_key(&ItemKey::ReplayGainAlbumPeak);
    }
    tag.save_to_path(path).map_err(|e| write_err(path, e))
}

pub fn delete(path: &Path) -> Result<()> {
    let mut tagged_file = Probe::open(path).map_err(|e| read_err(path, e))?.read().map_err(|e| read_err(path, e))?;
    let tag_type = tagged_file.primary_tag_type();
    if let Some(tag) = tagged_file.tag_mut(tag_type) {
        for key in [
            ItemKey::ReplayGainTrackGain,
            ItemKey::ReplayGainTrackPeak,
            ItemKey::ReplayGainAlbumGain,
            ItemKey::ReplayGainAlbumPeak,
        ] {
            tag.remove_key(&key);
        }
        tag.save_to_path(path).map_err(|e| write_err(path, e))?;
    }
    Ok(())
}

/// A zero peak is treated as "not tagged" (spec §4.4), same as the other
/// four formats; the original tool's APE probe never applied this rule
/// (`has_rg_info` has a standing `// TODO: implement "0.0 workaround" for
/// ape`), but the spec states it unqualified, with no per-format carve-out.
pub fn has_tag(path: &Path) -> Result<bool> {
    let tagged_file = Probe::open(path).map_err(|e| read_err(path, e))?.read().map_err(|e| read_err(path, e))?;
    let Some(tag) = tagged_file.primary_tag() else { return Ok(false) };

    let peak_is_zero = |key: ItemKey| tag.get_string(&key).and_then(parse_value) == Some(0.0);
    if peak_is_zero(ItemKey::ReplayGainAlbumPeak) || peak_is_zero(ItemKey::ReplayGainTrackPeak) {
        return Ok(false);
    }
    Ok(tag.get_string(&ItemKey::ReplayGainAlbumGain).is_some()
        || tag.get_string(&ItemKey::ReplayGainAlbumPeak).is_some()
        || tag.get_string(&ItemKey::ReplayGainTrackGain).is_some()
        || tag.get_string(&ItemKey::ReplayGainTrackPeak).is_some())
}
