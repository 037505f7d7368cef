//! Mapping remote paths onto HSM filesystems.
//!
//! Matching is per path component, so `/a` covers `/a/b` but not `/ab`. The
//! longest matching mount wins; no match, or a tie between equally long
//! mounts, is an error.

use std::path::Path;

use crate::api::Filesystem;
use crate::error::{StagingError, StagingResult};

/// Pick the filesystem serving `path`.
///
/// # Errors
///
/// Returns [`StagingError::AmbiguousFilesystem`] when no mount covers the path
/// or when two mounts of the same depth do.
pub fn resolve_filesystem<'a>(
    path: &str,
    filesystems: &'a [Filesystem],
) -> StagingResult<&'a Filesystem> {
    let target = Path::new(path);
    let matching: Vec<&Filesystem> = filesystems
        .iter()
        .filter(|fs| !fs.mount.is_empty() && target.starts_with(&fs.mount))
        .collect();

    let depth = |fs: &Filesystem| Path::new(&fs.mount).components().count();
    let deepest = matching.iter().map(|fs| depth(fs)).max();
    let winners: Vec<&Filesystem> = matching
        .iter()
        .copied()
        .filter(|fs| Some(depth(fs)) == deepest)
        .collect();

    match winners.as_slice() {
        [single] => Ok(*single),
        _ => Err(StagingError::AmbiguousFilesystem {
            path: path.to_string(),
            matches: winners.iter().map(|fs| fs.mount.clone()).collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mounts() -> Vec<Filesystem> {
        vec![
            Filesystem::new("1", "/a"),
            Filesystem::new("2", "/a/b"),
            Filesystem::new("3", "/ab"),
        ]
    }

    #[test]
    fn longest_prefix_wins() -> anyhow::Result<()> {
        let fs = mounts();
        assert_eq!(resolve_filesystem("/a/b/file.nc", &fs)?.fsid, "2");
        assert_eq!(resolve_filesystem("/a/c/file.nc", &fs)?.fsid, "1");
        assert_eq!(resolve_filesystem("/ab/file.nc", &fs)?.fsid, "3");
        Ok(())
    }

    #[test]
    fn trailing_slash_on_mount_is_ignored() -> anyhow::Result<()> {
        let fs = vec![Filesystem::new("9", "/hsm/")];
        assert_eq!(resolve_filesystem("/hsm/run/out.nc", &fs)?.fsid, "9");
        Ok(())
    }

    #[test]
    fn no_match_is_an_error() {
        let err = resolve_filesystem("/elsewhere/file.nc", &mounts()).expect_err("no mount");
        assert!(matches!(
            err,
            StagingError::AmbiguousFilesystem { ref matches, .. } if matches.is_empty()
        ));
    }

    #[test]
    fn equal_depth_duplicates_are_an_error() {
        let fs = vec![Filesystem::new("1", "/hsm"), Filesystem::new("2", "/hsm")];
        let err = resolve_filesystem("/hsm/file.nc", &fs).expect_err("tie");
        assert!(matches!(
            err,
            StagingError::AmbiguousFilesystem { ref matches, .. } if matches.len() == 2
        ));
    }
}
