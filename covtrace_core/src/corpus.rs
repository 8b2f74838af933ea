use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;

/// Largest test case the engine will accept, in bytes. Anything bigger is a
/// configuration problem, not an input to silently skip.
pub const MAX_INPUT_SIZE: u64 = 1 << 20;

/// Errors that can arise while discovering the input corpus.
///
/// All of these are fatal: the engine either has a malformed corpus or
/// nothing to execute, and both must be reported before any run starts.
#[derive(Error, Debug)]
pub enum CorpusError {
    /// The input directory could not be enumerated at all.
    #[error("unable to scan input directory {path:?}: {source}")]
    Scan {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A directory entry could not be inspected (stat or access failure).
    #[error("unable to inspect test case {path:?}: {source}")]
    Inspect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// A test case exceeds `MAX_INPUT_SIZE`.
    #[error("test case {path:?} is too big ({len} bytes, limit is {limit} bytes)")]
    Oversized { path: PathBuf, len: u64, limit: u64 },

    /// Discovery finished with zero usable entries.
    #[error(
        "no usable test cases in {path:?}; the engine needs at least one \
         non-empty regular file stored directly in the input directory"
    )]
    NoTestCases { path: PathBuf },
}

/// One corpus input, plus the scheduling metadata derived after discovery.
///
/// The `*_since_min` fields are offsets from the earliest modification time
/// seen across the whole corpus. They are informational and never alter the
/// execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub path: PathBuf,
    pub len: u64,
    pub mtime: u64,
    pub seconds_since_min: u64,
    pub minutes_since_min: u64,
    pub hours_since_min: u64,
}

/// The ordered collection of test cases for one campaign.
///
/// Records are created during discovery, reordered by `sort_by_mtime`, and
/// never removed while the campaign runs.
#[derive(Debug, Default)]
pub struct Corpus {
    entries: Vec<TestCase>,
    min_mtime: u64,
    max_mtime: u64,
}

impl Corpus {
    /// Enumerates `dir` and builds one record per usable entry.
    ///
    /// A `queue` subdirectory, when present, is scanned instead of `dir`
    /// itself so that a previous campaign's output can be resumed in place.
    /// Entries are visited in file-name order, which keeps discovery
    /// deterministic across runs and platforms. Non-regular files, empty
    /// files and any `README.txt` are skipped; an oversized file aborts
    /// discovery.
    pub fn discover(dir: &Path) -> Result<Self, CorpusError> {
        let queue_dir = dir.join("queue");
        let scan_root = if queue_dir.is_dir() {
            queue_dir
        } else {
            dir.to_path_buf()
        };

        let read_dir = fs::read_dir(&scan_root).map_err(|source| CorpusError::Scan {
            path: scan_root.clone(),
            source,
        })?;
        let mut paths = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|source| CorpusError::Scan {
                path: scan_root.clone(),
                source,
            })?;
            paths.push(entry.path());
        }
        // Raw directory order varies by filesystem; sorting by name keeps
        // record ordering reproducible.
        paths.sort();

        let mut corpus = Corpus::default();
        for path in paths {
            let meta = fs::symlink_metadata(&path).map_err(|source| CorpusError::Inspect {
                path: path.clone(),
                source,
            })?;

            if !meta.is_file() || meta.len() == 0 {
                continue;
            }
            if path.file_name() == Some(OsStr::new("README.txt")) {
                continue;
            }
            if meta.len() > MAX_INPUT_SIZE {
                return Err(CorpusError::Oversized {
                    path,
                    len: meta.len(),
                    limit: MAX_INPUT_SIZE,
                });
            }

            let modified = meta.modified().map_err(|source| CorpusError::Inspect {
                path: path.clone(),
                source,
            })?;
            // Pre-epoch mtimes clamp to zero.
            let mtime = modified
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);

            corpus.push(TestCase {
                path,
                len: meta.len(),
                mtime,
                seconds_since_min: 0,
                minutes_since_min: 0,
                hours_since_min: 0,
            });
        }

        if corpus.entries.is_empty() {
            return Err(CorpusError::NoTestCases {
                path: dir.to_path_buf(),
            });
        }
        Ok(corpus)
    }

    fn push(&mut self, record: TestCase) {
        if self.entries.is_empty() {
            self.min_mtime = record.mtime;
            self.max_mtime = record.mtime;
        } else {
            self.min_mtime = self.min_mtime.min(record.mtime);
            self.max_mtime = self.max_mtime.max(record.mtime);
        }
        self.entries.push(record);
    }

    /// Reorders records by ascending modification time. Ties keep no
    /// particular relative order.
    pub fn sort_by_mtime(&mut self) {
        self.entries.sort_unstable_by_key(|record| record.mtime);
    }

    /// Fills the second/minute/hour offsets of every record relative to the
    /// earliest modification time captured during discovery.
    pub fn compute_time_buckets(&mut self) {
        let min_mtime = self.min_mtime;
        for record in &mut self.entries {
            record.seconds_since_min = record.mtime - min_mtime;
            record.minutes_since_min = record.seconds_since_min / 60;
            record.hours_since_min = record.seconds_since_min / 3600;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, TestCase> {
        self.entries.iter()
    }

    pub fn min_mtime(&self) -> u64 {
        self.min_mtime
    }

    pub fn max_mtime(&self) -> u64 {
        self.max_mtime
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::time::{Duration, SystemTime};

    fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut file = File::create(&path).expect("failed to create test file");
        file.write_all(contents).expect("failed to write test file");
        path
    }

    fn set_mtime(path: &Path, secs_after_epoch: u64) {
        let file = File::options()
            .write(true)
            .open(path)
            .expect("failed to reopen test file");
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs_after_epoch))
            .expect("failed to set mtime");
    }

    #[test]
    fn discover_skips_empty_files_readme_and_directories() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        write_file(dir.path(), "a_case", b"aaaa");
        write_file(dir.path(), "empty", b"");
        write_file(dir.path(), "README.txt", b"docs, not a test case");
        fs::create_dir(dir.path().join("subdir")).expect("mkdir failed");

        let corpus = Corpus::discover(dir.path()).expect("discovery failed");
        assert_eq!(corpus.len(), 1);
        let names: Vec<_> = corpus
            .iter()
            .map(|r| r.path.file_name().unwrap().to_owned())
            .collect();
        assert_eq!(names, ["a_case"]);
    }

    #[test]
    fn discover_is_name_ordered_and_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        write_file(dir.path(), "zz", b"z");
        write_file(dir.path(), "aa", b"a");
        write_file(dir.path(), "mm", b"m");

        let first = Corpus::discover(dir.path()).expect("discovery failed");
        let second = Corpus::discover(dir.path()).expect("discovery failed");

        let order = |c: &Corpus| -> Vec<PathBuf> { c.iter().map(|r| r.path.clone()).collect() };
        assert_eq!(order(&first), order(&second));
        let names: Vec<_> = first
            .iter()
            .map(|r| r.path.file_name().unwrap().to_owned())
            .collect();
        assert_eq!(names, ["aa", "mm", "zz"]);
    }

    #[test]
    fn discover_prefers_queue_subdirectory() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let queue = dir.path().join("queue");
        fs::create_dir(&queue).expect("mkdir failed");
        write_file(dir.path(), "stale_case", b"old");
        write_file(&queue, "queued_case", b"new");

        let corpus = Corpus::discover(dir.path()).expect("discovery failed");
        assert_eq!(corpus.len(), 1);
        assert_eq!(
            corpus.iter().next().unwrap().path.file_name().unwrap(),
            "queued_case"
        );
    }

    #[test]
    fn oversized_test_case_is_a_fatal_error() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let big = vec![0u8; (MAX_INPUT_SIZE + 1) as usize];
        write_file(dir.path(), "too_big", &big);

        match Corpus::discover(dir.path()) {
            Err(CorpusError::Oversized { len, limit, .. }) => {
                assert_eq!(len, MAX_INPUT_SIZE + 1);
                assert_eq!(limit, MAX_INPUT_SIZE);
            }
            other => panic!("expected Oversized error, got {other:?}"),
        }
    }

    #[test]
    fn empty_directory_is_a_fatal_error() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        match Corpus::discover(dir.path()) {
            Err(CorpusError::NoTestCases { .. }) => {}
            other => panic!("expected NoTestCases error, got {other:?}"),
        }
    }

    #[test]
    fn sort_and_buckets_follow_modification_time() {
        let dir = tempfile::tempdir().expect("tempdir failed");
        let newest = write_file(dir.path(), "a_newest", b"n");
        let oldest = write_file(dir.path(), "b_oldest", b"o");
        let middle = write_file(dir.path(), "c_middle", b"m");
        set_mtime(&oldest, 1_000_000);
        set_mtime(&middle, 1_000_090);
        set_mtime(&newest, 1_007_300);

        let mut corpus = Corpus::discover(dir.path()).expect("discovery failed");
        corpus.sort_by_mtime();
        corpus.compute_time_buckets();

        let records: Vec<_> = corpus.iter().collect();
        assert_eq!(records[0].path, oldest);
        assert_eq!(records[1].path, middle);
        assert_eq!(records[2].path, newest);

        assert_eq!(records[0].seconds_since_min, 0);
        assert_eq!(records[1].seconds_since_min, 90);
        assert_eq!(records[1].minutes_since_min, 1);
        assert_eq!(records[2].seconds_since_min, 7300);
        assert_eq!(records[2].minutes_since_min, 121);
        assert_eq!(records[2].hours_since_min, 2);

        let mut last = 0;
        for record in &records {
            assert!(record.seconds_since_min >= last);
            last = record.seconds_since_min;
        }
    }
}
