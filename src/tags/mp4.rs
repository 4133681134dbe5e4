//! MP4/iTunes freeform-atom tag writer (spec §4.4), via `lofty`'s generic
//! `ItemKey` mapping: `ItemKey::ReplayGain*` resolves to the
//! `----:com.apple.iTunes:replaygain_{track,album}_{gain,peak}` atoms for
//! the MP4 ilst tag type, the same mapping the original tool wrote by hand.

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

/// Missing `moov`/ilst tag atom maps to `UnsupportedFormat` (spec §4.4).
fn require_tag<'a>(
    path: &Path,
    tagged_file: &'a mut lofty::TaggedFile,
) -> Result<&'a mut lofty::Tag> {
    let tag_type = tagged_file.primary_tag_type();
    if tagged_file.tag(tag_type).is_none() {
        return Err(Error::UnsupportedFormat(path.display().to_string()));
    }
    Ok(tagged_file.tag_mut(tag_type).expect("checked above"))
}

pub fn write(path: &Path, gain: &GainData) -> Result<()> {
    let mut tagged_file = Probe::open(path).map_err(|e| read_err(path, e))?.read().map_err(|e| read_err(path, e))?;
    let tag = require_tag(path, &mut tagged_file)?;

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
    let tag = require_tag(path, &mut tagged_file)?;
    for key in [
        ItemKey::ReplayGainTrackGain,
        ItemKey::ReplayGainTrackPeak,
        ItemKey::ReplayGainAlbumGain,
        ItemKey::ReplayGainAlbumPeak,
    ] {
        tag.remove_key(&key);
    }
    tag.save_to_path(path).map_err(|e| write_err(path, e))
}

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
