//! Decoder Interface (spec §4.5): a narrow contract consumed by the rest of
//! the crate, backed by a closed set of compiled-in backends selected by
//! file extension rather than a dynamic plugin loader (spec Design Notes §9).

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use symphonia::core::audio::{SampleBuffer, SignalSpec};
use symphonia::core::codecs::{Decoder as SymphoniaDecoder, DecoderOptions};
use symphonia::core::formats::FormatReader;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Duration;

use crate::error::{Error, Result};
use crate::meter::ChannelRole;

/// Serializes decoder-backend selection, preserving the source's
/// non-reentrant-codec-registry precaution even though the compiled-in
/// backends here don't strictly require it (spec §5).
static DECODER_INIT_LOCK: Mutex<()> = Mutex::new(());

/// A finite, lazily-produced stream of interleaved, normalized `f64` PCM.
pub trait Decoder {
    fn channels(&self) -> u32;
    fn sample_rate(&self) -> u32;
    fn total_frames(&self) -> Option<u64> {
        None
    }
    /// Optional explicit channel layout; `None` means the caller should use
    /// the Meter's default index-based map.
    fn channel_roles(&self) -> Option<Vec<ChannelRole>> {
        None
    }
    /// Returns the next block of interleaved samples, or `None` at EOF.
    fn read_frames(&mut self, path: &str) -> Result<Option<Vec<f64>>>;
}

/// Opens the extension-appropriate backend for `path`.
pub fn open<P: AsRef<Path>>(path: P) -> Result<Box<dyn Decoder>> {
    open_forced(path, None)
}

/// Opens `path` with the named backend instead of the one its extension
/// would normally select (`--force-decoder`, spec §4.5 / §9 Open Question:
/// the original's "forced plugin" knob becomes a compiled-in backend name
/// rather than a shared-library path). `forced` is one of `"flac"` or
/// `"generic"`; any other value is rejected as an unsupported format.
pub fn open_forced<P: AsRef<Path>>(path: P, forced: Option<&str>) -> Result<Box<dyn Decoder>> {
    let path = path.as_ref();
    let _guard = DECODER_INIT_LOCK.lock().unwrap();

    let backend = match forced {
        Some(name) => name.to_ascii_lowercase(),
        None => path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .or_else(|| sniff_extension(path))
            .unwrap_or_default(),
    };

    match backend.as_str() {
        "flac" => Ok(Box::new(FlacDecoder::open(path)?)),
        "generic" | "" => Ok(Box::new(GenericDecoder::open(path)?)),
        other if forced.is_some() => Err(Error::UnsupportedFormat(format!("unknown forced decoder backend: {other}"))),
        _ => Ok(Box::new(GenericDecoder::open(path)?)),
    }
}

/// claxon-backed FLAC decoder. Block decoding is eager (matching the
/// teacher's original `from_flac_file`); [`read_frames`] serves the
/// resulting interleaved buffer back to callers in fixed-size chunks so the
/// Decoder Interface's "lazy, finite sequence" contract still holds from the
/// caller's point of view.
pub struct FlacDecoder {
    channels: u32,
    sample_rate: u32,
    total_frames: Option<u64>,
    samples: Vec<f64>,
    cursor: usize,
}

const FLAC_CHUNK_FRAMES: usize = 4096;

impl FlacDecoder {
    fn open(path: &Path) -> Result<Self> {
        let path_str = path.display().to_string();
        let mut reader = claxon::FlacReader::open(path).map_err(|e| Error::DecoderOpenFailed {
            path: path_str.clone(),
            source: Box::new(e),
        })?;
        let info = reader.streaminfo();
        let channels = info.channels;
        let max = (1i64 << (info.bits_per_sample - 1)) as f64;

        let mut samples = Vec::new();
        for sample in reader.samples() {
            let sample = sample.map_err(|e| Error::DecoderReadFailed {
                path: path_str.clone(),
                source: Box::new(e),
            })?;
            samples.push(sample as f64 / max);
        }

        Ok(Self {
            channels,
            sample_rate: info.sample_rate,
            total_frames: info.samples,
            samples,
            cursor: 0,
        })
    }
}

impl Decoder for FlacDecoder {
    fn channels(&self) -> u32 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_frames(&self) -> Option<u64> {
        self.total_frames
    }

    fn read_frames(&mut self, _path: &str) -> Result<Option<Vec<f64>>> {
        if self.cursor >= self.samples.len() {
            return Ok(None);
        }
        let chunk_len = (FLAC_CHUNK_FRAMES * self.channels as usize).min(self.samples.len() - self.cursor);
        let chunk = self.samples[self.cursor..self.cursor + chunk_len].to_vec();
        self.cursor += chunk_len;
        Ok(Some(chunk))
    }
}

/// symphonia-backed generic decoder (MP3, AAC, ALAC, MP4-contained audio).
pub struct GenericDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn SymphoniaDecoder>,
    track_id: u32,
    channels: u32,
    sample_rate: u32,
    total_frames: Option<u64>,
    sample_buf: Option<SampleBuffer<f32>>,
}

impl GenericDecoder {
    fn open(path: &Path) -> Result<Self> {
        let path_str = path.display().to_string();
        let open_err = |e: Box<dyn std::error::Error + Send + Sync>| Error::DecoderOpenFailed {
            path: path_str.clone(),
            source: e,
        };

        let file = File::open(path).map_err(|e| open_err(Box::new(e)))?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let meta_opts: MetadataOptions = Default::default();
        let fmt_opts = symphonia::core::formats::FormatOptions::default();
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &fmt_opts, &meta_opts)
            .map_err(|e| open_err(Box::new(e)))?;

        let format = probed.format;
        let track = format
            .default_track()
            .ok_or_else(|| Error::UnsupportedFormat(path_str.clone()))?;
        let track_id = track.id;
        let channels = track
            .codec_params
            .channels
            .map(|c| c.count() as u32)
            .ok_or_else(|| Error::UnsupportedFormat(path_str.clone()))?;
        let sample_rate = track
            .codec_params
            .sample_rate
            .ok_or_else(|| Error::UnsupportedFormat(path_str.clone()))?;
        let total_frames = track.codec_params.n_frames;

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions { verify: true })
            .map_err(|e| open_err(Box::new(e)))?;

        Ok(Self {
            format,
            decoder,
            track_id,
            channels,
            sample_rate,
            total_frames,
            sample_buf: None,
        })
    }
}

impl Decoder for GenericDecoder {
    fn channels(&self) -> u32 {
        self.channels
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_frames(&self) -> Option<u64> {
        self.total_frames
    }

    fn read_frames(&mut self, path: &str) -> Result<Option<Vec<f64>>> {
        let read_err = |e: Box<dyn std::error::Error + Send + Sync>| Error::DecoderReadFailed {
            path: path.to_string(),
            source: e,
        };
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(symphonia::core::errors::Error::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None)
                }
                Err(e) => return Err(read_err(Box::new(e))),
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            let audio_buf = self.decoder.decode(&packet).map_err(|e| read_err(Box::new(e)))?;
            if self.sample_buf.is_none() {
                let spec: SignalSpec = *audio_buf.spec();
                let duration: Duration = audio_buf.capacity() as u64;
                self.sample_buf = Some(SampleBuffer::new(duration, spec));
            }
            if let Some(buf) = &mut self.sample_buf {
                buf.copy_interleaved_ref(audio_buf);
                let samples: Vec<f64> = buf.samples().iter().map(|&s| s as f64).collect();
                return Ok(Some(samples));
            }
        }
    }
}

/// Recursively walks `root`, collecting files whose extension is one of the
/// formats this crate can decode, optionally sorted by path (spec §4.6).
pub fn walk_supported(root: &Path, recursive: bool, sort: bool) -> std::io::Result<Vec<PathBuf>> {
    const EXTS: &[&str] = &[
        "flac", "ogg", "oga", "opus", "mp2", "mp3", "mp4", "m4a", "wv", "mpc",
    ];
    let mut out = Vec::new();
    walk_dir(root, recursive, EXTS, &mut out)?;
    if sort {
        out.sort();
    }
    Ok(out)
}

fn walk_dir(dir: &Path, recursive: bool, exts: &[&str], out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    if dir.is_file() {
        if has_supported_ext(dir, exts) {
            out.push(dir.to_path_buf());
        }
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            if recursive {
                walk_dir(&path, recursive, exts, out)?;
            }
        } else if has_supported_ext(&path, exts) {
            out.push(path);
        }
    }
    Ok(())
}

fn has_supported_ext(path: &Path, exts: &[&str]) -> bool {
    let named = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| exts.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false);
    named || sniff_extension(path).map(|e| exts.contains(&e.as_str())).unwrap_or(false)
}

/// Content-sniffs `path`'s container format when its extension is missing or
/// unrecognized, so a correctly-named-but-extensionless file (or one renamed
/// by a careless rip) is not silently skipped.
fn sniff_extension(path: &Path) -> Option<String> {
    infer::get_from_path(path).ok().flatten().map(|t| t.extension().to_string())
}
