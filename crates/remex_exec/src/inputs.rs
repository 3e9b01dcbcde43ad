//! Input file bookkeeping around local execution.

use remex_storage::ActionInput;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Recorded when an input cannot be stat'ed
const UNKNOWN_CTIME: i64 = -1;

/// Snapshot the last status-change time of every real input
///
/// Virtual inputs are skipped. An input that cannot be stat'ed is recorded
/// as `-1`, so an input missing in both snapshots does not count as a
/// change.
#[must_use]
pub fn input_ctimes(exec_root: &Path, inputs: &BTreeMap<PathBuf, ActionInput>) -> HashMap<PathBuf, i64> {
    inputs
        .iter()
        .filter(|(_, input)| !input.is_virtual())
        .map(|(path, _)| {
            let ctime = fs::metadata(exec_root.join(path)).map_or(UNKNOWN_CTIME, |meta| ctime_nanos(&meta));
            (path.clone(), ctime)
        })
        .collect()
}

/// Whether any input changed between two snapshots
#[must_use]
pub fn inputs_changed(before: &HashMap<PathBuf, i64>, after: &HashMap<PathBuf, i64>) -> bool {
    if before.len() != after.len() {
        return true;
    }
    before.iter().any(|(path, ctime)| {
        let changed = after.get(path) != Some(ctime);
        if changed {
            debug!(path = %path.display(), "input changed during execution");
        }
        changed
    })
}

/// Write every virtual parameter file into the exec root
///
/// Existing files are replaced. Returns how many files were written.
///
/// # Errors
///
/// Returns error if a file or its parent directory cannot be written
pub fn materialize_param_files(exec_root: &Path, inputs: &[ActionInput]) -> io::Result<usize> {
    let mut written = 0;
    for input in inputs {
        let ActionInput::Virtual(virtual_input) = input else {
            continue;
        };
        if !virtual_input.is_param_file {
            continue;
        }
        let path = exec_root.join(&virtual_input.exec_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        fs::write(&path, &virtual_input.contents)?;
        trace!(path = %path.display(), "materialized param file");
        written += 1;
    }
    Ok(written)
}

#[cfg(unix)]
fn ctime_nanos(meta: &fs::Metadata) -> i64 {
    use std::os::unix::fs::MetadataExt;
    meta.ctime().saturating_mul(1_000_000_000).saturating_add(meta.ctime_nsec())
}

#[cfg(not(unix))]
fn ctime_nanos(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map_or(UNKNOWN_CTIME, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use remex_storage::VirtualActionInput;

    fn mapping(inputs: Vec<ActionInput>) -> BTreeMap<PathBuf, ActionInput> {
        inputs
            .into_iter()
            .map(|i| (i.exec_path().to_path_buf(), i))
            .collect()
    }

    #[test]
    fn test_ctimes_skip_virtual_and_mark_missing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let inputs = mapping(vec![
            ActionInput::file("a.txt"),
            ActionInput::file("missing.txt"),
            ActionInput::Virtual(VirtualActionInput::new("v.txt", "v")),
        ]);

        let ctimes = input_ctimes(dir.path(), &inputs);
        assert_eq!(ctimes.len(), 2);
        assert!(ctimes[Path::new("a.txt")] > 0);
        assert_eq!(ctimes[Path::new("missing.txt")], UNKNOWN_CTIME);
        assert!(!ctimes.contains_key(Path::new("v.txt")));
    }

    #[test]
    fn test_missing_before_and_after_is_not_a_change() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = mapping(vec![ActionInput::file("gone.txt")]);
        let before = input_ctimes(dir.path(), &inputs);
        let after = input_ctimes(dir.path(), &inputs);
        assert!(!inputs_changed(&before, &after));
    }

    #[test]
    fn test_deleted_input_is_a_change() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let inputs = mapping(vec![ActionInput::file("a.txt")]);
        let before = input_ctimes(dir.path(), &inputs);
        fs::remove_file(dir.path().join("a.txt")).unwrap();
        let after = input_ctimes(dir.path(), &inputs);
        assert!(inputs_changed(&before, &after));
    }

    #[test]
    fn test_materialize_only_param_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("out")).unwrap();
        fs::write(dir.path().join("out/args.params"), b"stale").unwrap();
        let inputs = vec![
            ActionInput::Virtual(VirtualActionInput::param_file("out/args.params", "-c\nmain.c\n")),
            ActionInput::Virtual(VirtualActionInput::param_file("deep/new/x.params", "-O2")),
            ActionInput::Virtual(VirtualActionInput::new("plain.txt", "nope")),
            ActionInput::file("real.c"),
        ];

        assert_eq!(materialize_param_files(dir.path(), &inputs).unwrap(), 2);
        assert_eq!(fs::read(dir.path().join("out/args.params")).unwrap(), b"-c\nmain.c\n");
        assert_eq!(fs::read(dir.path().join("deep/new/x.params")).unwrap(), b"-O2");
        assert!(!dir.path().join("plain.txt").exists());
    }
}
