use std::path::PathBuf;

use gumdrop::Options;

use crate::tags::{OpusReference, OpusTagInfo};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// loudgainer scans audio files, measures their loudness per EBU R128 /
/// ITU-R BS.1770, and can write ReplayGain-compatible tags for the format
/// the file is actually stored in.
#[derive(Debug, Options)]
pub struct Args {
    #[options(help = "Show this help")]
    pub help: bool,

    #[options(help = "Show version number")]
    pub version: bool,

    #[options(short = "v", help = "increase log verbosity (overrides RUST_LOG default level)")]
    pub verbose: bool,

    #[options(command)]
    pub command: Option<Command>,
}

#[derive(Debug, Options)]
pub enum Command {
    /// Measure loudness and print results without writing any tags.
    #[options(help = "Measure loudness, print results, write nothing")]
    Scan(ScanOpts),

    /// Measure loudness and write ReplayGain tags.
    #[options(help = "Measure loudness and write ReplayGain tags")]
    Tag(TagOpts),

    /// Print the per-100ms and per-3s block energies of each input file.
    #[options(help = "Dump momentary/short-term block loudness series")]
    Dump(DumpOpts),
}

#[derive(Debug, Options)]
pub struct ScanOpts {
    #[options(free, help = "audio files or directories")]
    pub files: Vec<PathBuf>,

    #[options(short = "r", help = "recurse into subdirectories")]
    pub recursive: bool,

    #[options(
        short = "a",
        help = "treat every input as one album, ignoring directory grouping"
    )]
    pub force_as_album: bool,

    #[options(help = "do not sort directory-expanded files by path")]
    pub no_sort: bool,

    #[options(short = "j", help = "worker threads per album group (default: available cores)", meta = "N")]
    pub jobs: Option<usize>,

    #[options(help = "force a specific decoder backend (\"flac\" or \"generic\") instead of selecting by extension", meta = "BACKEND")]
    pub force_decoder: Option<String>,
}

#[derive(Debug, Options)]
pub struct TagOpts {
    #[options(free, help = "audio files or directories")]
    pub files: Vec<PathBuf>,

    #[options(short = "r", help = "recurse into subdirectories")]
    pub recursive: bool,

    #[options(short = "t", help = "write track gain only, skip album aggregation")]
    pub track: bool,

    #[options(short = "n", help = "measure and print, but do not write tags")]
    pub dry_run: bool,

    #[options(
        short = "i",
        help = "skip files that already carry ReplayGain tags (spec §5 has_tag probe)"
    )]
    pub incremental: bool,

    #[options(
        short = "a",
        help = "treat every input as one album, ignoring directory grouping"
    )]
    pub force_as_album: bool,

    #[options(help = "do not sort directory-expanded files by path")]
    pub no_sort: bool,

    #[options(help = "write VorbisGain-compatible extra fields to Opus Comments")]
    pub opus_vorbisgain_compat: bool,

    #[options(
        help = "patch the Opus Ogg header gain instead of leaving it at zero; see --help for <spec> grammar",
        meta = "SPEC"
    )]
    pub opus_header_gain: Option<String>,

    #[options(short = "j", help = "worker threads per album group (default: available cores)", meta = "N")]
    pub jobs: Option<usize>,

    #[options(help = "force a specific decoder backend (\"flac\" or \"generic\") instead of selecting by extension", meta = "BACKEND")]
    pub force_decoder: Option<String>,
}

#[derive(Debug, Options)]
pub struct DumpOpts {
    #[options(free, help = "audio files")]
    pub files: Vec<PathBuf>,

    #[options(help = "dump short-term (3s) blocks instead of momentary (400ms) blocks")]
    pub shortterm: bool,

    #[options(help = "force a specific decoder backend (\"flac\" or \"generic\") instead of selecting by extension", meta = "BACKEND")]
    pub force_decoder: Option<String>,
}

pub fn parse_args() -> Args {
    let args = Args::parse_args_default_or_exit();
    if args.version {
        println!("loudgainer {VERSION}");
        std::process::exit(0);
    }
    args
}

/// Parses the `--opus-header-gain=<spec>` grammar (spec §6):
///
/// - a bare signed decimal, e.g. `-3.5`, is an absolute dB header gain.
/// - `r128[,track][,offset=DB]` or `rg[,track][,offset=DB]` derives the
///   header gain from the R128 album (default) or track gain, with an
///   optional additional dB offset; both prefixes are handled identically,
///   the R128 reference already folding in the implicit ReplayGain offset.
pub fn parse_opus_header_gain(spec: &str) -> Result<OpusTagInfo, String> {
    let spec = spec.trim();
    if let Ok(db) = spec.parse::<f64>() {
        return Ok(OpusTagInfo { vorbisgain_compat: false, reference: OpusReference::Absolute, offset_db: db, is_track: false });
    }

    let mut parts = spec.split(',');
    let head = parts.next().ok_or_else(|| "empty --opus-header-gain spec".to_string())?;
    if !head.eq_ignore_ascii_case("r128") && !head.eq_ignore_ascii_case("rg") {
        return Err(format!("unrecognized --opus-header-gain spec: {spec}"));
    }

    let mut is_track = false;
    let mut offset_db = 0.0;
    for part in parts {
        let part = part.trim();
        if part.eq_ignore_ascii_case("track") {
            is_track = true;
        } else if let Some(value) = part.strip_prefix("offset=").or_else(|| part.strip_prefix("offset =")) {
            offset_db = value.trim().parse::<f64>().map_err(|_| format!("invalid offset in --opus-header-gain spec: {spec}"))?;
        } else {
            return Err(format!("unrecognized --opus-header-gain component '{part}' in: {spec}"));
        }
    }

    Ok(OpusTagInfo { vorbisgain_compat: false, reference: OpusReference::R128, offset_db, is_track })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_spec_parses_as_decimal() {
        let info = parse_opus_header_gain("-3.5").unwrap();
        assert_eq!(info.reference, OpusReference::Absolute);
        assert_eq!(info.offset_db, -3.5);
        assert!(!info.is_track);
    }

    #[test]
    fn r128_and_rg_prefixes_are_equivalent() {
        let a = parse_opus_header_gain("r128").unwrap();
        let b = parse_opus_header_gain("rg").unwrap();
        assert_eq!(a.reference, OpusReference::R128);
        assert_eq!(b.reference, OpusReference::R128);
        assert_eq!(a.offset_db, 0.0);
        assert!(!a.is_track);
    }

    #[test]
    fn track_and_offset_modifiers_apply() {
        let info = parse_opus_header_gain("r128,track,offset=1.5").unwrap();
        assert!(info.is_track);
        assert_eq!(info.offset_db, 1.5);
    }

    #[test]
    fn unrecognized_spec_is_rejected() {
        assert!(parse_opus_header_gain("bogus").is_err());
        assert!(parse_opus_header_gain("r128,bogus").is_err());
    }
}
