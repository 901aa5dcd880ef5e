use std::path::Path;

const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "avi", "mov", "wmv", "flv", "webm", "m4v", "ts", "mts", "m2ts",
];

const EXCLUDED_BASENAME_PATTERNS: &[&str] = &[
    "sample", "trailer", "preview", "extra", "bonus", "behind", "making",
];

const MIN_PREFERRED_SIZE: u64 = 10 * 1024 * 1024;

/// A torrent file as seen by the selection policy. Deliberately decoupled from any engine
/// type so the policy can be exercised against plain fixtures in tests.
#[derive(Debug, Clone)]
pub struct CandidateFile {
    pub index: usize,
    pub relative_path: std::path::PathBuf,
    pub length: u64,
}

fn has_video_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            VIDEO_EXTENSIONS.contains(&e.as_str())
        })
        .unwrap_or(false)
}

fn is_excluded_by_basename(path: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n.to_ascii_lowercase(),
        None => return false,
    };
    EXCLUDED_BASENAME_PATTERNS
        .iter()
        .any(|pattern| name.contains(pattern))
}

/// Implements the file-selection policy: extension filter, sample-pattern exclusion, a
/// size preference with graceful fallback, then largest-first. Returns `None` when nothing
/// survives the filters, which the caller maps to `no_media`.
pub fn select_video_file(files: &[CandidateFile]) -> Option<&CandidateFile> {
    let step1: Vec<&CandidateFile> = files
        .iter()
        .filter(|f| has_video_extension(&f.relative_path))
        .collect();

    let step2: Vec<&CandidateFile> = step1
        .into_iter()
        .filter(|f| !is_excluded_by_basename(&f.relative_path))
        .collect();

    if step2.is_empty() {
        return None;
    }

    let preferred: Vec<&&CandidateFile> = step2
        .iter()
        .filter(|f| f.length >= MIN_PREFERRED_SIZE)
        .collect();

    let pool: Vec<&CandidateFile> = if preferred.is_empty() {
        step2
    } else {
        preferred.into_iter().copied().collect()
    };

    pool.into_iter().max_by_key(|f| f.length)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(index: usize, path: &str, length: u64) -> CandidateFile {
        CandidateFile {
            index,
            relative_path: path.into(),
            length,
        }
    }

    #[test]
    fn picks_largest_surviving_file() {
        let files = vec![
            candidate(0, "movie.mkv", 1_500_000_000),
            candidate(1, "sample.mp4", 40 * 1024 * 1024),
            candidate(2, "readme.txt", 1024),
        ];
        let picked = select_video_file(&files).unwrap();
        assert_eq!(picked.index, 0);
    }

    #[test]
    fn falls_back_below_10mib_if_nothing_qualifies() {
        let files = vec![candidate(0, "movie.mp4", 9 * 1024 * 1024)];
        let picked = select_video_file(&files).unwrap();
        assert_eq!(picked.index, 0);
    }

    #[test]
    fn excludes_sample_trailer_and_similar() {
        let files = vec![
            candidate(0, "Movie.Trailer.mkv", 2_000_000_000),
            candidate(1, "movie.mkv", 1_000_000_000),
        ];
        let picked = select_video_file(&files).unwrap();
        assert_eq!(picked.index, 1);
    }

    #[test]
    fn non_video_extensions_are_never_selected() {
        let files = vec![candidate(0, "subtitles.srt", 10_000_000_000)];
        assert!(select_video_file(&files).is_none());
    }

    #[test]
    fn empty_input_yields_no_media() {
        assert!(select_video_file(&[]).is_none());
    }

    #[test]
    fn extension_match_is_case_insensitive() {
        let files = vec![candidate(0, "Movie.MKV", 20 * 1024 * 1024)];
        assert!(select_video_file(&files).is_some());
    }
}
