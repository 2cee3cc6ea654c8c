use crate::errors::ReplayError;
use std::fs;
use std::path::{Path, PathBuf};

/// Stamp of a `run-<unix_ms>.jsonl` file, `None` for anything else.
pub fn run_log_stamp(path: &Path) -> Option<u128> {
    path.file_name()?
        .to_str()?
        .strip_prefix("run-")?
        .strip_suffix(".jsonl")?
        .parse()
        .ok()
}

/// Removes the oldest run logs in `dir` until the run logs together fit in
/// `budget_bytes`. Only `run-<unix_ms>.jsonl` files are considered, and
/// `active` is kept whatever its size.
pub fn enforce_total_budget(
    dir: &Path,
    budget_bytes: u64,
    active: &Path,
) -> Result<Vec<PathBuf>, ReplayError> {
    let mut runs = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| ReplayError::Io(e.to_string()))? {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        let Some(stamp) = run_log_stamp(&path) else {
            continue;
        };
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_file() {
            runs.push((stamp, meta.len(), path));
        }
    }
    runs.sort_by_key(|(stamp, _, _)| *stamp);

    let mut total: u64 = runs.iter().map(|(_, len, _)| len).sum();
    let mut removed = Vec::new();
    for (_, len, path) in runs {
        if total <= budget_bytes {
            break;
        }
        if path == active {
            continue;
        }
        fs::remove_file(&path)
            .map_err(|e| ReplayError::Io(format!("{}: {e}", path.display())))?;
        total = total.saturating_sub(len);
        removed.push(path);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::{enforce_total_budget, run_log_stamp};
    use std::fs;
    use std::path::Path;

    #[test]
    fn oldest_runs_go_first_and_other_files_are_left_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("run-300.jsonl"), vec![0u8; 40]).expect("newest");
        fs::write(dir.path().join("run-100.jsonl"), vec![0u8; 40]).expect("oldest");
        fs::write(dir.path().join("run-200.jsonl"), vec![0u8; 40]).expect("middle");
        fs::write(dir.path().join("notes.txt"), vec![0u8; 400]).expect("unrelated");

        let removed =
            enforce_total_budget(dir.path(), 50, &dir.path().join("run-300.jsonl")).expect("prune");
        assert_eq!(removed.len(), 2);
        assert!(removed[0].ends_with("run-100.jsonl"));
        assert!(removed[1].ends_with("run-200.jsonl"));
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn active_run_survives_even_when_over_budget() {
        let dir = tempfile::tempdir().expect("tempdir");
        let active = dir.path().join("run-5.jsonl");
        fs::write(&active, vec![0u8; 80]).expect("active");

        let removed = enforce_total_budget(dir.path(), 10, &active).expect("prune");
        assert!(removed.is_empty());
        assert!(active.exists());
    }

    #[test]
    fn stamp_is_parsed_from_run_file_names_only() {
        assert_eq!(run_log_stamp(Path::new("/l/run-1700000000000.jsonl")), Some(1_700_000_000_000));
        assert_eq!(run_log_stamp(Path::new("/l/run-x.jsonl")), None);
        assert_eq!(run_log_stamp(Path::new("/l/other.jsonl")), None);
    }
}
