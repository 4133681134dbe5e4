//! Xiph Comment tag writer for FLAC (`metaflac`) and Ogg Vorbis/`.oga`
//! (`lofty`). Opus is handled separately in `opus` since it additionally
//! needs the raw header-gain byte patch.

use std::path::Path;

use lofty::{ItemKey, Probe, TagExt, TaggedFileExt};

use super::{format_gain, format_peak};
use crate::aggregator::GainData;
use crate::error::{Error, Result};

const TRACK_GAIN: &str = "REPLAYGAIN_TRACK_GAIN";
const TRACK_PEAK: &str = "REPLAYGAIN_TRACK_PEAK";
const ALBUM_GAIN: &str = "REPLAYGAIN_ALBUM_GAIN";
const ALBUM_PEAK: &str = "REPLAYGAIN_ALBUM_PEAK";

fn read_err(path: &Path, e: impl std::error::Error + Send + Sync + 'static) -> Error {
    Error::TagReadFailed { path: path.display().to_string(), source: Box::new(e) }
}

fn write_err(path: &Path, e: impl std::error::Error + Send + Sync + 'static) -> Error {
    Error::TagWriteFailed { path: path.display().to_string(), source: Box::new(e) }
}

fn is_flac(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()).map(|e| e.eq_ignore_ascii_case("flac")).unwrap_or(false)
}

fn parse_value(raw: &str) -> Option<f64> {
    let s = raw.trim();
    let s = s.strip_suffix("dB").map(str::trim).unwrap_or(s);
    s.parse::<f64>().ok()
}

pub fn write(path: &Path, gain: &GainData) -> Result<()> {
    if is_flac(path) {
        write_flac(path, gain)
    } else {
        write_generic(path, gain)
    }
}

pub fn delete(path: &Path) -> Result<()> {
    if is_flac(path) {
        delete_flac(path)
    } else {
        delete_generic(path)
    }
}

pub fn has_tag(path: &Path) -> Result<bool> {
    if is_flac(path) {
        has_tag_flac(path)
    } else {
        has_tag_generic(path)
    }
}

fn write_flac(path: &Path, gain: &GainData) -> Result<()> {
    let mut tag = metaflac::Tag::read_from_path(path).map_err(|e| read_err(path, e))?;
    tag.set_vorbis(TRACK_GAIN, vec![format_gain(gain.track_gain_db)]);
    tag.set_vorbis(TRACK_PEAK, vec![format_peak(gain.track_peak)]);
    if gain.album_mode {
        tag.set_vorbis(ALBUM_GAIN, vec![format_gain(gain.album_gain_db)]);
        tag.set_vorbis(ALBUM_PEAK, vec![format_peak(gain.album_peak)]);
    } else {
        tag.remove_vorbis(ALBUM_GAIN);
        tag.remove_vorbis(ALBUM_PEAK);
    }
    tag.write_to_path(path).map_err(|e| write_err(path, e))
}

fn delete_flac(path: &Path) -> Result<()> {
    let mut tag = metaflac::Tag::read_from_path(path).map_err(|e| read_err(path, e))?;
    for key in [TRACK_GAIN, TRACK_PEAK, ALBUM_GAIN, ALBUM_PEAK] {
        tag.remove_vorbis(key);
    }
    tag.write_to_path(path).map_err(|e| write_err(path, e))
}

fn has_tag_flac(path: &Path) -> Result<bool> {
    let tag = metaflac::Tag::read_from_path(path).map_err(|e| read_err(path, e))?;
    let peak_is_zero = |key: &str| {
        tag.get_vorbis(key)
            .map(|mut values| values.any(|v| parse_value(v) == Some(0.0)))
            .unwrap_or(false)
    };
    if peak_is_zero(ALBUM_PEAK) || peak_is_zero(TRACK_PEAK) {
        return Ok(false);
    }
    let present =
        |key: &str| tag.get_vorbis(key).map(|mut v| v.next().is_some()).unwrap_or(false);
    Ok(present(ALBUM_GAIN) || present(ALBUM_PEAK) || present(TRACK_GAIN) || present(TRACK_PEAK))
}

fn write_generic(path: &Path, gain: &GainData) -> Result<()> {
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

fn delete_generic(path: &Path) -> Result<()> {
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

fn has_tag_generic(path: &Path) -> Result<bool> {
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
