//! Opus tag writer (spec §4.4): patches the mandatory 16-bit header-gain
//! field in the identification packet and rewrites the `OpusTags` comment
//! packet's `R128_*` / `REPLAYGAIN_*` fields.
//!
//! The Opus comment header is byte-for-byte the Vorbis comment format with
//! an `OpusTags` magic instead of `\x03vorbis` (RFC 7845 §5.2), so it is
//! decoded/encoded by hand here — `ogg` gives us packet framing only, not
//! comment semantics. The identification header's gain field lives at byte
//! offset 16..18 (RFC 7845 §5.1), the only raw container bytes this crate
//! edits directly (spec §6).

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use ogg::reading::PacketReader;
use ogg::writing::{PacketWriteEndInfo, PacketWriter};

use super::{clamp_gain, format_gain, format_peak, OpusReference, OpusTagInfo};
use crate::aggregator::GainData;
use crate::error::{Error, Result};

const ID_MAGIC: &[u8] = b"OpusHead";
const TAGS_MAGIC: &[u8] = b"OpusTags";

const R128_TRACK_GAIN: &str = "R128_TRACK_GAIN";
const R128_ALBUM_GAIN: &str = "R128_ALBUM_GAIN";
const REPLAYGAIN_TRACK_GAIN: &str = "REPLAYGAIN_TRACK_GAIN";
const REPLAYGAIN_TRACK_PEAK: &str = "REPLAYGAIN_TRACK_PEAK";
const REPLAYGAIN_ALBUM_GAIN: &str = "REPLAYGAIN_ALBUM_GAIN";
const REPLAYGAIN_ALBUM_PEAK: &str = "REPLAYGAIN_ALBUM_PEAK";

fn read_err(path: &Path, e: impl std::error::Error + Send + Sync + 'static) -> Error {
    Error::TagReadFailed { path: path.display().to_string(), source: Box::new(e) }
}

fn write_err(path: &Path, e: impl std::error::Error + Send + Sync + 'static) -> Error {
    Error::TagWriteFailed { path: path.display().to_string(), source: Box::new(e) }
}

/// A decoded Vorbis-comment-shaped list: vendor string plus `key=value`
/// entries, in on-disk order.
struct Comments {
    vendor: String,
    entries: Vec<(String, String)>,
}

impl Comments {
    fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 8 || &data[..8] != TAGS_MAGIC {
            return Err(Error::OpusHeaderMalformed("comment packet missing OpusTags magic".into()));
        }
        let mut pos = 8usize;
        let vendor_len = read_u32(data, &mut pos)? as usize;
        let vendor = read_str(data, &mut pos, vendor_len)?;
        let count = read_u32(data, &mut pos)?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = read_u32(data, &mut pos)? as usize;
            let entry = read_str(data, &mut pos, len)?;
            let (k, v) = entry
                .split_once('=')
                .ok_or_else(|| Error::OpusHeaderMalformed("comment entry missing '='".into()))?;
            entries.push((k.to_string(), v.to_string()));
        }
        Ok(Self { vendor, entries })
    }

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(TAGS_MAGIC);
        out.extend_from_slice(&(self.vendor.len() as u32).to_le_bytes());
        out.extend_from_slice(self.vendor.as_bytes());
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for (k, v) in &self.entries {
            let entry = format!("{k}={v}");
            out.extend_from_slice(&(entry.len() as u32).to_le_bytes());
            out.extend_from_slice(entry.as_bytes());
        }
        out
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)).map(|(_, v)| v.as_str())
    }

    fn set(&mut self, key: &str, value: String) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        self.entries.push((key.to_string(), value));
    }

    fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
    }
}

fn read_u32(data: &[u8], pos: &mut usize) -> Result<u32> {
    let end = *pos + 4;
    let bytes: [u8; 4] = data
        .get(*pos..end)
        .ok_or_else(|| Error::OpusHeaderMalformed("truncated comment length field".into()))?
        .try_into()
        .expect("slice of length 4");
    *pos = end;
    Ok(u32::from_le_bytes(bytes))
}

fn read_str(data: &[u8], pos: &mut usize, len: usize) -> Result<String> {
    let end = *pos + len;
    let bytes = data.get(*pos..end).ok_or_else(|| Error::OpusHeaderMalformed("truncated comment string".into()))?;
    *pos = end;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

fn encode_q78(db: f64) -> i16 {
    (256.0 * db).round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

struct Adjusted {
    header_gain: i16,
    track_gain_db: f64,
    track_peak: f64,
    album_gain_db: f64,
    album_peak: f64,
    r128_track_gain: i16,
    r128_album_gain: i16,
}

/// Implements spec §4.4's Opus math: header gain first (step 1-2), then
/// re-derives displayed/R128 gains and peaks against the applied header
/// gain (steps 3-4), clamping only at the end (step 6 / spec §9 Open
/// Question — do not clamp before the adjustment).
fn compute(gain: &GainData, info: &OpusTagInfo) -> Adjusted {
    let header_gain_db = match info.reference {
        OpusReference::Absolute => info.offset_db,
        OpusReference::R128 => {
            let base = if info.is_track {
                gain.track_gain_db
            } else if gain.album_mode {
                gain.album_gain_db
            } else {
                gain.track_gain_db
            };
            base - 5.0 + info.offset_db
        }
    };
    let header_gain = encode_q78(header_gain_db);
    let applied_db = header_gain as f64 / 256.0;

    let adjust_gain = |g: f64| g - applied_db;
    let adjust_peak = |p: f64| {
        if p > 0.0 {
            10f64.powf((20.0 * p.log10() - applied_db) / 20.0)
        } else {
            p
        }
    };

    let track_gain_adj = adjust_gain(gain.track_gain_db);
    let album_gain_adj = adjust_gain(gain.album_gain_db);

    Adjusted {
        header_gain,
        track_gain_db: clamp_gain(track_gain_adj),
        track_peak: adjust_peak(gain.track_peak),
        album_gain_db: clamp_gain(album_gain_adj),
        album_peak: adjust_peak(gain.album_peak),
        r128_track_gain: encode_q78(track_gain_adj - 5.0),
        r128_album_gain: encode_q78(album_gain_adj - 5.0),
    }
}

struct RawPacket {
    data: Vec<u8>,
    stream_serial: u32,
    absgp_page: u64,
    last_packet: bool,
}

fn read_packets(path: &Path) -> Result<Vec<RawPacket>> {
    let file = File::open(path).map_err(|e| read_err(path, e))?;
    let mut reader = PacketReader::new(BufReader::new(file));
    let mut out = Vec::new();
    loop {
        match reader.read_packet().map_err(|e| read_err(path, e))? {
            None => break,
            Some(pck) => out.push(RawPacket {
                data: pck.data,
                stream_serial: pck.stream_serial,
                absgp_page: pck.absgp_page,
                last_packet: pck.last_packet,
            }),
        }
    }
    Ok(out)
}

fn write_packets(path: &Path, packets: &[RawPacket]) -> Result<()> {
    let tmp_path = path.with_extension("opus.rgtmp");
    {
        let tmp_file = File::create(&tmp_path).map_err(|e| write_err(path, e))?;
        let mut writer = PacketWriter::new(BufWriter::new(tmp_file));
        for pck in packets {
            let info = if pck.last_packet { PacketWriteEndInfo::EndStream } else { PacketWriteEndInfo::NormalPacket };
            writer
                .write_packet(pck.data.clone(), pck.stream_serial, info, pck.absgp_page)
                .map_err(|e| write_err(path, e))?;
        }
    }
    std::fs::rename(&tmp_path, path).map_err(|e| write_err(path, e))
}

fn patch_header_gain(id_packet: &mut Vec<u8>, gain: i16) -> Result<()> {
    if id_packet.len() < 18 || &id_packet[..8] != ID_MAGIC {
        return Err(Error::OpusHeaderMalformed("identification packet missing OpusHead magic".into()));
    }
    let bytes = gain.to_le_bytes();
    id_packet[16] = bytes[0];
    id_packet[17] = bytes[1];
    Ok(())
}

fn current_header_gain(id_packet: &[u8]) -> Result<i16> {
    if id_packet.len() < 18 || &id_packet[..8] != ID_MAGIC {
        return Err(Error::OpusHeaderMalformed("identification packet missing OpusHead magic".into()));
    }
    Ok(i16::from_le_bytes([id_packet[16], id_packet[17]]))
}

fn apply_replaygain_fields(comments: &mut Comments, info: Option<OpusTagInfo>, adjusted: &Adjusted, album_mode: bool) {
    comments.set(R128_TRACK_GAIN, adjusted.r128_track_gain.to_string());
    if album_mode {
        comments.set(R128_ALBUM_GAIN, adjusted.r128_album_gain.to_string());
    } else {
        comments.remove(R128_ALBUM_GAIN);
    }

    let vorbisgain_compat = info.map(|i| i.vorbisgain_compat).unwrap_or(false);
    if vorbisgain_compat {
        comments.set(REPLAYGAIN_TRACK_GAIN, format_gain(adjusted.track_gain_db));
        comments.set(REPLAYGAIN_TRACK_PEAK, format_peak(adjusted.track_peak));
        if album_mode {
            comments.set(REPLAYGAIN_ALBUM_GAIN, format_gain(adjusted.album_gain_db));
            comments.set(REPLAYGAIN_ALBUM_PEAK, format_peak(adjusted.album_peak));
        } else {
            comments.remove(REPLAYGAIN_ALBUM_GAIN);
            comments.remove(REPLAYGAIN_ALBUM_PEAK);
        }
    } else {
        comments.remove(REPLAYGAIN_TRACK_GAIN);
        comments.remove(REPLAYGAIN_TRACK_PEAK);
        comments.remove(REPLAYGAIN_ALBUM_GAIN);
        comments.remove(REPLAYGAIN_ALBUM_PEAK);
    }
}

pub fn write(path: &Path, gain: &GainData, info: Option<OpusTagInfo>) -> Result<()> {
    let default_info =
        OpusTagInfo { vorbisgain_compat: false, reference: OpusReference::R128, offset_db: 0.0, is_track: !gain.album_mode };
    let effective = info.unwrap_or(default_info);

    let mut packets = read_packets(path)?;
    let id_idx = 0;
    let tags_idx = 1;
    if packets.len() < 2 {
        return Err(Error::OpusHeaderMalformed("file has fewer than two packets".into()));
    }

    let adjusted = compute(gain, &effective);
    patch_header_gain(&mut packets[id_idx].data, adjusted.header_gain)?;

    let mut comments = Comments::decode(&packets[tags_idx].data)?;
    apply_replaygain_fields(&mut comments, info, &adjusted, gain.album_mode);
    packets[tags_idx].data = comments.encode();

    write_packets(path, &packets)
}

pub fn delete(path: &Path) -> Result<()> {
    let mut packets = read_packets(path)?;
    if packets.len() < 2 {
        return Err(Error::OpusHeaderMalformed("file has fewer than two packets".into()));
    }
    patch_header_gain(&mut packets[0].data, 0)?;

    let mut comments = Comments::decode(&packets[1].data)?;
    for key in [R128_TRACK_GAIN, R128_ALBUM_GAIN, REPLAYGAIN_TRACK_GAIN, REPLAYGAIN_TRACK_PEAK, REPLAYGAIN_ALBUM_GAIN, REPLAYGAIN_ALBUM_PEAK]
    {
        comments.remove(key);
    }
    packets[1].data = comments.encode();

    write_packets(path, &packets)
}

pub fn has_tag(path: &Path) -> Result<bool> {
    let packets = read_packets(path)?;
    if packets.len() < 2 {
        return Err(Error::OpusHeaderMalformed("file has fewer than two packets".into()));
    }
    let _ = current_header_gain(&packets[0].data)?;
    let comments = Comments::decode(&packets[1].data)?;

    let parse = |s: &str| {
        let s = s.trim();
        s.strip_suffix("dB").map(str::trim).unwrap_or(s).parse::<f64>().ok()
    };
    let peak_is_zero =
        |key: &str| comments.get(key).and_then(parse).map(|v| v == 0.0).unwrap_or(false);
    if peak_is_zero(REPLAYGAIN_ALBUM_PEAK) || peak_is_zero(REPLAYGAIN_TRACK_PEAK) {
        return Ok(false);
    }

    Ok(comments.get(R128_TRACK_GAIN).is_some()
        || comments.get(R128_ALBUM_GAIN).is_some()
        || comments.get(REPLAYGAIN_TRACK_GAIN).is_some()
        || comments.get(REPLAYGAIN_ALBUM_GAIN).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_comments() -> Vec<u8> {
        Comments { vendor: "test".to_string(), entries: vec![("TITLE".to_string(), "Song".to_string())] }.encode()
    }

    #[test]
    fn comments_roundtrip() {
        let bytes = sample_comments();
        let decoded = Comments::decode(&bytes).unwrap();
        assert_eq!(decoded.vendor, "test");
        assert_eq!(decoded.get("title"), Some("Song"));
    }

    #[test]
    fn q78_encoding_matches_spec_example() {
        // S5: album_gain = -3.00 dB, R128 reference, album mode.
        let gain = GainData { track_gain_db: 0.0, track_peak: 0.0, album_mode: true, album_gain_db: -3.0, album_peak: 0.0 };
        let info = OpusTagInfo { vorbisgain_compat: false, reference: OpusReference::R128, offset_db: 0.0, is_track: false };
        let adjusted = compute(&gain, &info);
        assert_eq!(adjusted.header_gain, -2048);
        assert_eq!(adjusted.r128_album_gain, 0);
    }

    #[test]
    fn header_gain_clamps_to_int16() {
        assert_eq!(encode_q78(1000.0), i16::MAX);
        assert_eq!(encode_q78(-1000.0), i16::MIN);
    }
}
