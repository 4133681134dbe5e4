//! Album grouping: partitions an ordered sequence of tracks into albums by
//! parent directory, or treats them as one or as singletons on demand
//! (spec §4.3).

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupingMode {
    /// Group by parent directory (default).
    ByDirectory,
    /// Every track is its own album-less group.
    PerTrackOnly,
    /// The entire input is a single album.
    ForceSingleAlbum,
}

/// Partitions `paths` (already in the desired input order) into groups
/// according to `mode`. Tracks retain their input order within a group;
/// groups are returned in input order.
pub fn group<'a>(paths: &'a [PathBuf], mode: GroupingMode) -> Vec<Vec<&'a Path>> {
    match mode {
        GroupingMode::PerTrackOnly => paths.iter().map(|p| vec![p.as_path()]).collect(),
        GroupingMode::ForceSingleAlbum => {
            if paths.is_empty() {
                Vec::new()
            } else {
                vec![paths.iter().map(|p| p.as_path()).collect()]
            }
        }
        GroupingMode::ByDirectory => {
            let mut groups: Vec<Vec<&Path>> = Vec::new();
            let mut current_dir: Option<&Path> = None;
            let mut current: Vec<&Path> = Vec::new();
            for path in paths {
                let dir = path.parent().unwrap_or_else(|| Path::new(""));
                match current_dir {
                    Some(d) if d == dir => current.push(path.as_path()),
                    _ => {
                        if !current.is_empty() {
                            groups.push(std::mem::take(&mut current));
                        }
                        current_dir = Some(dir);
                        current.push(path.as_path());
                    }
                }
            }
            if !current.is_empty() {
                groups.push(current);
            }
            groups
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn groups_by_directory() {
        let ps = paths(&["a/1.flac", "a/2.flac", "b/1.flac"]);
        let groups = group(&ps, GroupingMode::ByDirectory);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1].len(), 1);
    }

    #[test]
    fn per_track_only_makes_singletons() {
        let ps = paths(&["a/1.flac", "a/2.flac"]);
        let groups = group(&ps, GroupingMode::PerTrackOnly);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 1);
    }

    #[test]
    fn force_single_album_makes_one_group() {
        let ps = paths(&["a/1.flac", "b/1.flac"]);
        let groups = group(&ps, GroupingMode::ForceSingleAlbum);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
    }

    #[test]
    fn empty_input_yields_no_groups() {
        let ps: Vec<PathBuf> = Vec::new();
        assert!(group(&ps, GroupingMode::ByDirectory).is_empty());
        assert!(group(&ps, GroupingMode::ForceSingleAlbum).is_empty());
    }
}
