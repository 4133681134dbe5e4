use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use rayon::prelude::*;

use crate::aggregator::{album_gain, merge_album_into_track, track_gain, GainData};
use crate::error::Result;
use crate::grouper::GroupingMode;
use crate::meter::{energy_to_lufs, loudness_range_multiple, Meter, Mode};
use crate::options::{Command, DumpOpts, ScanOpts, TagOpts};
use crate::tags::OpusTagInfo;

mod aggregator;
mod decoder;
mod error;
mod grouper;
mod meter;
mod options;
mod tags;

fn main() {
    let args = options::parse_args();
    let mut log_builder = env_logger::Builder::from_default_env();
    if args.verbose {
        log_builder.filter_level(log::LevelFilter::Debug);
    }
    log_builder.init();
    debug!("{:#?}", args);

    let ok = match args.command {
        Some(Command::Scan(opts)) => run_scan(opts),
        Some(Command::Tag(opts)) => run_tag(opts),
        Some(Command::Dump(opts)) => run_dump(opts),
        None => {
            eprintln!("no subcommand given; try `scan`, `tag`, `dump`, or --help");
            false
        }
    };

    if !ok {
        std::process::exit(1);
    }
}

/// Expands file/directory inputs into a flat list of decodable tracks,
/// sorted by path unless `--no-sort` is given (spec §4.6).
fn collect_input_paths(files: &[PathBuf], recursive: bool, sort: bool) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for f in files {
        if f.is_dir() {
            match decoder::walk_supported(f, recursive, sort) {
                Ok(found) => out.extend(found),
                Err(e) => warn!("skipping {}: {e}", f.display()),
            }
        } else {
            out.push(f.clone());
        }
    }
    out
}

fn grouping_mode(force_as_album: bool, track_only: bool) -> GroupingMode {
    if track_only {
        GroupingMode::PerTrackOnly
    } else if force_as_album {
        GroupingMode::ForceSingleAlbum
    } else {
        GroupingMode::ByDirectory
    }
}

fn build_pool(jobs: Option<usize>) -> rayon::ThreadPool {
    rayon::ThreadPoolBuilder::new()
        .num_threads(jobs.unwrap_or(0))
        .build()
        .expect("failed to start worker pool")
}

/// Measures one track's loudness. Runs on a pool worker (spec §5).
fn scan_track(path: &Path, modes: Mode, force_decoder: Option<&str>) -> Result<Meter> {
    let mut decoder = decoder::open_forced(path, force_decoder)?;
    let mut meter = Meter::new(decoder.channels(), decoder.sample_rate(), modes)?;
    if let Some(roles) = decoder.channel_roles() {
        for (i, role) in roles.into_iter().enumerate() {
            meter.set_channel(i, role);
        }
    }
    let path_str = path.display().to_string();
    while let Some(frames) = decoder.read_frames(&path_str)? {
        meter.add_frames(&frames);
    }
    Ok(meter)
}

fn run_scan(opts: ScanOpts) -> bool {
    let paths = collect_input_paths(&opts.files, opts.recursive, !opts.no_sort);
    if paths.is_empty() {
        warn!("no input files");
        return true;
    }
    let groups = grouper::group(&paths, grouping_mode(opts.force_as_album, false));
    let pool = build_pool(opts.jobs);
    let mut ok = true;

    let force_decoder = opts.force_decoder.as_deref();
    for group in groups {
        let modes = Mode::I | Mode::LRA;
        let results: Vec<(&Path, Result<Meter>)> = pool.install(|| {
            group.par_iter().map(|&path| (path, scan_track(path, modes, force_decoder))).collect()
        });

        let mut meters = Vec::new();
        for (path, result) in &results {
            match result {
                Ok(meter) => {
                    println!(
                        "{}\tloudness={:.2} LUFS\trange={:.2} LU\tpeak={:.6}",
                        path.display(),
                        meter.loudness_global(),
                        meter.loudness_range(),
                        meter.max_sample_peak()
                    );
                    meters.push(meter);
                }
                Err(e) => {
                    error!("{}: {e}", path.display());
                    ok = false;
                }
            }
        }

        if group.len() > 1 && meters.len() == group.len() {
            let gains: Vec<GainData> = meters.iter().map(|m| track_gain(m)).collect();
            let refs: Vec<&Meter> = meters.iter().copied().collect();
            let album = album_gain(&refs, &gains);
            let album_range = loudness_range_multiple(refs.iter().copied());
            println!(
                "album\tgain={:+.2} dB\trange={:.2} LU\tpeak={:.6}",
                album.album_gain_db, album_range, album.album_peak
            );
        }
    }
    ok
}

/// Measures, aggregates, and writes ReplayGain tags for one album group
/// (spec §5's "Grouper thread" sequencing: workers run in parallel, then
/// aggregation and tagging happen back on this thread).
fn tag_group(group: &[&Path], opts: &TagOpts, opus_info: Option<OpusTagInfo>, pool: &rayon::ThreadPool) -> bool {
    let track_only = opts.track || group.len() < 2;
    let modes = Mode::I;
    let mut ok = true;

    let candidates: Vec<&Path> = if opts.incremental {
        group
            .iter()
            .copied()
            .filter(|&path| match tags::has_tag(path) {
                Ok(true) => {
                    info!("skipping already-tagged {}", path.display());
                    false
                }
                Ok(false) => true,
                Err(e) => {
                    warn!("{}: {e}", path.display());
                    true
                }
            })
            .collect()
    } else {
        group.to_vec()
    };
    if candidates.is_empty() {
        return true;
    }

    let force_decoder = opts.force_decoder.as_deref();
    let results: Vec<(&Path, Result<Meter>)> = pool.install(|| {
        candidates.par_iter().map(|&path| (path, scan_track(path, modes, force_decoder))).collect()
    });

    let mut paths = Vec::new();
    let mut meters = Vec::new();
    for (path, result) in results {
        match result {
            Ok(meter) => {
                paths.push(path);
                meters.push(meter);
            }
            Err(e) => {
                error!("{}: {e}", path.display());
                ok = false;
            }
        }
    }
    if meters.is_empty() {
        return ok;
    }

    let track_gains: Vec<GainData> = meters.iter().map(track_gain).collect();
    let finals: Vec<GainData> = if track_only {
        track_gains
    } else {
        let refs: Vec<&Meter> = meters.iter().collect();
        let album = album_gain(&refs, &track_gains);
        track_gains.into_iter().map(|g| merge_album_into_track(g, &album)).collect()
    };

    for (path, gain) in paths.iter().zip(finals.iter()) {
        if opts.dry_run {
            println!(
                "{}\ttrack_gain={:+.2} dB\ttrack_peak={:.6}",
                path.display(),
                gain.track_gain_db,
                gain.track_peak
            );
            continue;
        }
        match tags::write_tags(path, gain, opus_info) {
            Ok(()) => info!("tagged {}", path.display()),
            Err(e) => {
                error!("{}: {e}", path.display());
                ok = false;
            }
        }
    }
    ok
}

fn run_tag(opts: TagOpts) -> bool {
    let paths = collect_input_paths(&opts.files, opts.recursive, !opts.no_sort);
    if paths.is_empty() {
        warn!("no input files");
        return true;
    }

    let opus_info = match &opts.opus_header_gain {
        Some(spec) => match options::parse_opus_header_gain(spec) {
            Ok(mut info) => {
                info.vorbisgain_compat = opts.opus_vorbisgain_compat;
                Some(info)
            }
            Err(e) => {
                error!("invalid --opus-header-gain: {e}");
                return false;
            }
        },
        None if opts.opus_vorbisgain_compat => Some(OpusTagInfo {
            vorbisgain_compat: true,
            reference: tags::OpusReference::R128,
            offset_db: 0.0,
            is_track: false,
        }),
        None => None,
    };

    let groups = grouper::group(&paths, grouping_mode(opts.force_as_album, opts.track));
    let pool = build_pool(opts.jobs);

    let mut ok = true;
    for group in &groups {
        if !tag_group(group, &opts, opus_info, &pool) {
            ok = false;
        }
    }
    ok
}

fn run_dump(opts: DumpOpts) -> bool {
    let mut ok = true;
    let modes = if opts.shortterm { Mode::S } else { Mode::M };
    let force_decoder = opts.force_decoder.as_deref();
    for path in &opts.files {
        match scan_track(path, modes, force_decoder) {
            Ok(meter) => {
                let series: &[f64] =
                    if opts.shortterm { meter.short_term_energies() } else { meter.block_energies() };
                println!("{}", path.display());
                for (i, &energy) in series.iter().enumerate() {
                    println!("{i}\t{:.2}", energy_to_lufs(energy));
                }
            }
            Err(e) => {
                error!("{}: {e}", path.display());
                ok = false;
            }
        }
    }
    ok
}
