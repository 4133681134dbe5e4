//! ID3v2 tag writer for MP3/MP2 (spec §4.4).
//!
//! Uses TXXX (`UserTextIdentificationFrame`-equivalent) frames for the
//! human-readable `REPLAYGAIN_*` values and, for ID3v2.4 only, RVA2 frames
//! carrying the binary gain/peak pair players read directly. The `id3` crate
//! has no typed RVA2 frame, so its payload is built by hand from the layout
//! in ID3v2.4 §4.11 and stored as `Content::Unknown`.

use std::path::Path;

use id3::{Content, Frame, Tag, TagLike, Version};

use super::{clamp_gain, format_gain, format_peak};
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

fn read_tag(path: &Path) -> Result<Tag> {
    match Tag::read_from_path(path) {
        Ok(tag) => Ok(tag),
        Err(e) if matches!(e.kind, id3::ErrorKind::NoTag) => Ok(Tag::new()),
        Err(e) => Err(read_err(path, e)),
    }
}

/// Lenient "N dB" / "N" parse; a trailing unit token is stripped if present
/// (spec §9 design notes).
fn parse_value(raw: &str) -> Option<f64> {
    let s = raw.trim();
    let s = s.strip_suffix("dB").map(str::trim).unwrap_or(s);
    s.parse::<f64>().ok()
}

/// Removes every TXXX frame whose description matches `description`
/// case-insensitively, returning the last parsed numeric value seen.
fn clear_txxx(tag: &mut Tag, description: &str) -> Option<f64> {
    let mut last = None;
    loop {
        let hit = tag
            .extended_texts()
            .find(|t| t.description.eq_ignore_ascii_case(description))
            .map(|t| (t.description.clone(), parse_value(&t.value)));
        match hit {
            Some((desc, value)) => {
                last = value.or(last);
                tag.remove_extended_text(Some(&desc), None);
            }
            None => break,
        }
    }
    last
}

fn set_txxx(tag: &mut Tag, description: &str, value: String) {
    tag.add_frame(Frame::with_content(
        "TXXX",
        Content::ExtendedText(id3::frame::ExtendedText { description: description.to_string(), value }),
    ));
}

fn rva2_identification(data: &[u8]) -> Option<String> {
    let end = data.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&data[..end]).ok().map(str::to_string)
}

/// Removes all RVA2 frames whose identification matches `identification`
/// case-insensitively. The `id3` crate's `remove` only works by frame id, so
/// matching RVA2 frames are filtered out and the rest are re-added.
fn clear_rva2(tag: &mut Tag, identification: &str) {
    let keep: Vec<Frame> = tag
        .frames()
        .filter(|f| {
            f.id() != "RVA2"
                || match f.content() {
                    Content::Unknown(u) => rva2_identification(&u.data)
                        .map(|id| !id.eq_ignore_ascii_case(identification))
                        .unwrap_or(true),
                    _ => true,
                }
        })
        .cloned()
        .collect();
    if keep.len() != tag.frames().count() {
        tag.remove("RVA2");
        for f in keep {
            tag.add_frame(f);
        }
    }
}

/// Builds and installs an RVA2 "master volume" frame per ID3v2.4 §4.11:
/// identification string, channel type, 16-bit signed adjustment (1/512 dB
/// units, matching TagLib's convention), then a 16-bit peak.
fn set_rva2(tag: &mut Tag, identification: &str, gain_db: f64, peak: f64) {
    clear_rva2(tag, identification);

    let mut data = Vec::with_capacity(identification.len() + 8);
    data.extend_from_slice(identification.as_bytes());
    data.push(0);
    data.push(1); // channel type: master volume
    let adjustment = (gain_db * 512.0).round().clamp(i16::MIN as f64, i16::MAX as f64) as i16;
    data.extend_from_slice(&adjustment.to_be_bytes());
    data.push(16); // bits representing peak
    let amp_peak = (peak * 32768.0).min(65535.0);
    let amp_peak_int = amp_peak.ceil() as u32;
    data.extend_from_slice(&amp_peak_int.to_be_bytes()[2..4]);

    tag.add_frame(Frame::with_content(
        "RVA2",
        Content::Unknown(id3::frame::Unknown { version: Version::Id3v24, data }),
    ));
}

fn clear_all(tag: &mut Tag) {
    clear_txxx(tag, ALBUM_GAIN);
    clear_txxx(tag, ALBUM_PEAK);
    clear_rva2(tag, "album");
    clear_txxx(tag, TRACK_GAIN);
    clear_txxx(tag, TRACK_PEAK);
    clear_rva2(tag, "track");
}

pub fn write(path: &Path, gain: &GainData) -> Result<()> {
    let mut tag = read_tag(path)?;
    let version = tag.version();
    clear_all(&mut tag);

    set_txxx(&mut tag, TRACK_GAIN, format_gain(gain.track_gain_db));
    set_txxx(&mut tag, TRACK_PEAK, format_peak(gain.track_peak));
    if version == Version::Id3v24 {
        set_rva2(&mut tag, "track", clamp_gain(gain.track_gain_db), gain.track_peak);
    }

    if gain.album_mode {
        set_txxx(&mut tag, ALBUM_GAIN, format_gain(gain.album_gain_db));
        set_txxx(&mut tag, ALBUM_PEAK, format_peak(gain.album_peak));
        if version == Version::Id3v24 {
            set_rva2(&mut tag, "album", clamp_gain(gain.album_gain_db), gain.album_peak);
        }
    }

    // v2.2 has no UTF-8/RVA2 support worth preserving; fold it up to v2.3.
    let save_version = if version == Version::Id3v24 { Version::Id3v24 } else { Version::Id3v23 };
    tag.write_to_path(path, save_version).map_err(|e| write_err(path, e))
}

pub fn delete(path: &Path) -> Result<()> {
    let mut tag = read_tag(path)?;
    let version = tag.version();
    clear_all(&mut tag);
    tag.write_to_path(path, version).map_err(|e| write_err(path, e))
}

pub fn has_tag(path: &Path) -> Result<bool> {
    let tag = read_tag(path)?;
    let mut tagged = false;

    if let Some(v) = find_txxx(&tag, ALBUM_PEAK) {
        if v == 0.0 {
            return Ok(false);
        }
        tagged = true;
    }
    if let Some(v) = find_txxx(&tag, TRACK_PEAK) {
        if v == 0.0 {
            return Ok(false);
        }
        tagged = true;
    }
    tagged |= find_txxx(&tag, ALBUM_GAIN).is_some();
    tagged |= find_txxx(&tag, TRACK_GAIN).is_some();
    tagged |= has_rva2(&tag, "album");
    tagged |= has_rva2(&tag, "track");
    Ok(tagged)
}

fn find_txxx(tag: &Tag, description: &str) -> Option<f64> {
    tag.extended_texts()
        .find(|t| t.description.eq_ignore_ascii_case(description))
        .and_then(|t| parse_value(&t.value))
}

fn has_rva2(tag: &Tag, identification: &str) -> bool {
    tag.frames().filter(|f| f.id() == "RVA2").any(|f| match f.content() {
        Content::Unknown(u) => {
            rva2_identification(&u.data).map(|id| id.eq_ignore_ascii_case(identification)).unwrap_or(false)
        }
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_value_strips_unit() {
        assert_eq!(parse_value("-5.23 dB"), Some(-5.23));
        assert_eq!(parse_value("3.5dB"), Some(3.5));
        assert_eq!(parse_value("2.00"), Some(2.0));
        assert!(parse_value("garbage").is_none());
    }

    #[test]
    fn clear_txxx_removes_case_insensitively() {
        let mut tag = Tag::new();
        set_txxx(&mut tag, "replaygain_track_gain", "+1.00 dB".to_string());
        let old = clear_txxx(&mut tag, TRACK_GAIN);
        assert_eq!(old, Some(1.0));
        assert_eq!(tag.extended_texts().count(), 0);
    }

    #[test]
    fn rva2_roundtrips_identification() {
        let mut tag = Tag::new();
        set_rva2(&mut tag, "track", -3.25, 0.5);
        assert!(has_rva2(&tag, "track"));
        assert!(!has_rva2(&tag, "album"));
        clear_rva2(&mut tag, "track");
        assert!(!has_rva2(&tag, "track"));
    }
}
