//! Locating the artifact a stage left behind.
//!
//! [`resolve_artifact`] picks among a stage's declared output locations;
//! [`salvage`] decides whether a stopped or killed stage left anything usable.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

const BVH_MAGIC: &[u8] = b"HIERARCHY";

/// Size of a file, or total size of the files directly inside a directory.
pub fn artifact_size(path: &Path) -> Option<u64> {
    let meta = fs::metadata(path).ok()?;
    if meta.is_file() {
        return Some(meta.len());
    }
    if meta.is_dir() {
        let total = fs::read_dir(path)
            .ok()?
            .filter_map(Result::ok)
            .filter_map(|entry| entry.metadata().ok())
            .filter(|m| m.is_file())
            .map(|m| m.len())
            .sum();
        return Some(total);
    }
    None
}

/// Pick the larger of the existing candidates.
///
/// Some tools write a full primary file and, when interrupted mid-write, a
/// smaller truncated file under a second name; the larger one is the usable
/// artifact. Ties go to the candidate listed first. Missing paths are skipped.
pub fn resolve_artifact(candidates: &[PathBuf]) -> Option<PathBuf> {
    select_largest(
        candidates
            .iter()
            .filter_map(|p| artifact_size(p).map(|size| (p.clone(), size))),
    )
}

/// Largest entry; the earliest one wins a tie.
fn select_largest(sized: impl Iterator<Item = (PathBuf, u64)>) -> Option<PathBuf> {
    let mut best: Option<(PathBuf, u64)> = None;
    for (path, size) in sized {
        match &best {
            Some((_, best_size)) if size <= *best_size => {}
            _ => best = Some((path, size)),
        }
    }
    best.map(|(path, _)| path)
}

/// A BVH file above `min_bytes` whose content starts with `HIERARCHY`.
pub fn is_valid_bvh(path: &Path, min_bytes: u64) -> bool {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() && meta.len() > min_bytes => {}
        _ => return false,
    }
    let mut head = [0u8; 64];
    let Ok(mut file) = fs::File::open(path) else {
        return false;
    };
    let Ok(n) = file.read(&mut head) else {
        return false;
    };
    let head = &head[..n];
    let head = head.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(head);
    let start = head.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(head.len());
    head[start..].starts_with(BVH_MAGIC)
}

/// What counts as usable when salvaging.
#[derive(Debug, Clone)]
pub struct SalvageRule<'a> {
    /// Declared output locations, checked first.
    pub candidates: &'a [PathBuf],
    /// Extension searched for in the working area.
    pub extension: Option<&'a str>,
    /// Anything at or below this size is ignored.
    pub min_bytes: u64,
}

impl SalvageRule<'_> {
    fn usable(&self, path: &Path) -> bool {
        let Some(size) = artifact_size(path) else {
            return false;
        };
        if size <= self.min_bytes {
            return false;
        }
        if self.extension == Some("bvh") && path.is_file() {
            return is_valid_bvh(path, self.min_bytes);
        }
        true
    }
}

/// Find a usable partial artifact: a declared output first, then a scan of
/// `dir` (recursively) for files with the rule's extension. Among scanned
/// files the largest wins; ties go to the lexicographically first path.
pub fn salvage(dir: &Path, rule: &SalvageRule<'_>) -> Option<PathBuf> {
    let declared = select_largest(
        rule.candidates
            .iter()
            .filter(|p| rule.usable(p))
            .filter_map(|p| artifact_size(p).map(|size| (p.clone(), size))),
    );
    if declared.is_some() {
        return declared;
    }

    let extension = rule.extension?;
    let mut found = Vec::new();
    collect_with_extension(dir, extension, &mut found);
    found.sort();
    select_largest(
        found
            .into_iter()
            .filter(|p| rule.usable(p))
            .filter_map(|p| artifact_size(&p).map(|size| (p, size))),
    )
}

fn collect_with_extension(dir: &Path, extension: &str, out: &mut Vec<PathBuf>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        match entry.file_type() {
            Ok(t) if t.is_dir() => collect_with_extension(&path, extension, out),
            Ok(t) if t.is_file() => {
                let matches = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case(extension));
                if matches {
                    out.push(path);
                }
            }
            _ => {}
        }
    }
}

/// Move `artifact` to `target` unless it is already there.
pub fn finalize_name(artifact: &Path, target: Option<&Path>) -> std::io::Result<PathBuf> {
    match target {
        Some(target) if target != artifact => {
            fs::rename(artifact, target)?;
            Ok(target.to_path_buf())
        }
        _ => Ok(artifact.to_path_buf()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bvh(bytes: usize) -> Vec<u8> {
        let mut data = b"HIERARCHY\nROOT Hips\n".to_vec();
        data.resize(bytes.max(data.len()), b' ');
        data
    }

    #[test]
    fn larger_candidate_wins() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = dir.path().join("mediapipe_walk");
        let typed = dir.path().join("mediapipe_walk.bvh");
        fs::write(&legacy, vec![b'x'; 100]).unwrap();
        fs::write(&typed, vec![b'x'; 5000]).unwrap();

        assert_eq!(resolve_artifact(&[legacy.clone(), typed.clone()]), Some(typed.clone()));
        assert_eq!(resolve_artifact(&[typed.clone(), legacy]), Some(typed));
    }

    #[test]
    fn tie_goes_to_first_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("a.bvh");
        fs::write(&a, vec![b'x'; 300]).unwrap();
        fs::write(&b, vec![b'y'; 300]).unwrap();
        assert_eq!(resolve_artifact(&[a.clone(), b.clone()]), Some(a.clone()));
        assert_eq!(resolve_artifact(&[b.clone(), a]), Some(b));
    }

    #[test]
    fn missing_candidates_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let only = dir.path().join("out.csv");
        fs::write(&only, "x").unwrap();
        assert_eq!(
            resolve_artifact(&[dir.path().join("nope"), only.clone()]),
            Some(only)
        );
        assert_eq!(resolve_artifact(&[dir.path().join("nope")]), None);
    }

    #[test]
    fn directory_candidate_sums_its_files() {
        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("openpose_json");
        fs::create_dir(&json).unwrap();
        fs::write(json.join("f_000_keypoints.json"), vec![b'{'; 80]).unwrap();
        fs::write(json.join("f_001_keypoints.json"), vec![b'{'; 80]).unwrap();
        assert_eq!(artifact_size(&json), Some(160));
    }

    #[test]
    fn bvh_validation_checks_size_and_header() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.bvh");
        let small = dir.path().join("small.bvh");
        let junk = dir.path().join("junk.bvh");
        fs::write(&good, bvh(500)).unwrap();
        fs::write(&small, b"HIERARCHY\n").unwrap();
        fs::write(&junk, vec![b'z'; 500]).unwrap();

        assert!(is_valid_bvh(&good, 100));
        assert!(!is_valid_bvh(&small, 100));
        assert!(!is_valid_bvh(&junk, 100));
        assert!(!is_valid_bvh(&dir.path().join("missing.bvh"), 100));
    }

    #[test]
    fn salvage_prefers_declared_output() {
        let dir = tempfile::tempdir().unwrap();
        let declared = dir.path().join("frames-mpdata").join("2dJoints_mediapipe.csv");
        fs::create_dir_all(declared.parent().unwrap()).unwrap();
        fs::write(&declared, vec![b'1'; 400]).unwrap();
        fs::write(dir.path().join("other.csv"), vec![b'1'; 4000]).unwrap();

        let candidates = [declared.clone()];
        let rule = SalvageRule { candidates: &candidates, extension: Some("csv"), min_bytes: 100 };
        assert_eq!(salvage(dir.path(), &rule), Some(declared));
    }

    #[test]
    fn salvage_scans_working_area() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("sub");
        fs::create_dir(&nested).unwrap();
        fs::write(dir.path().join("tiny.bvh"), bvh(50)).unwrap();
        fs::write(nested.join("partial.bvh"), bvh(900)).unwrap();
        fs::write(dir.path().join("broken.bvh"), vec![b'0'; 2000]).unwrap();

        let candidates = [dir.path().join("missing.bvh")];
        let rule = SalvageRule { candidates: &candidates, extension: Some("bvh"), min_bytes: 100 };
        assert_eq!(salvage(dir.path(), &rule), Some(nested.join("partial.bvh")));
    }

    #[test]
    fn salvage_rejects_everything_below_minimum() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.csv"), vec![b'1'; 100]).unwrap();
        let rule = SalvageRule { candidates: &[], extension: Some("csv"), min_bytes: 100 };
        assert_eq!(salvage(dir.path(), &rule), None);

        let no_ext = SalvageRule { candidates: &[], extension: None, min_bytes: 0 };
        assert_eq!(salvage(dir.path(), &no_ext), None);
    }

    #[test]
    fn finalize_renames_legacy_output() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = dir.path().join("mediapipe_walk");
        let target = dir.path().join("mediapipe_walk.bvh");
        fs::write(&legacy, bvh(200)).unwrap();

        let finalized = finalize_name(&legacy, Some(&target)).unwrap();
        assert_eq!(finalized, target);
        assert!(target.exists());
        assert!(!legacy.exists());

        assert_eq!(finalize_name(&target, Some(&target)).unwrap(), target);
        assert_eq!(finalize_name(&target, None).unwrap(), target);
    }
}
