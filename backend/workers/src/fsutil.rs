use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context;
use chrono::{DateTime, Utc};

/// Replace `path` with `data` so readers see either the old or the new
/// contents, never a partial file.
pub fn atomic_write(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)
        .with_context(|| format!("Failed to create directory {parent:?}"))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".equaforge-")
        .suffix(".tmp")
        .tempfile_in(&parent)
        .with_context(|| format!("Failed to create temp file in {parent:?}"))?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .with_context(|| format!("Failed to move temp file onto {path:?}"))?;
    Ok(())
}

/// Modification time of `path`, or `None` if it does not exist.
pub fn modified_at(path: &Path) -> anyhow::Result<Option<DateTime<Utc>>> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(Some(DateTime::<Utc>::from(meta.modified()?))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to stat {path:?}")),
    }
}

/// The file under `dir` (recursively) with the given extension and the
/// strictly greatest modification time. The first one seen wins a tie.
pub fn newest_file(dir: &Path, extension: &str) -> anyhow::Result<Option<PathBuf>> {
    let mut best: Option<(SystemTime, PathBuf)> = None;
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e).with_context(|| format!("Failed to read {current:?}")),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let meta = entry.metadata()?;
            if meta.is_dir() {
                pending.push(path);
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(extension) {
                continue;
            }
            let modified = meta.modified()?;
            let newer = match &best {
                Some((seen, _)) => modified > *seen,
                None => true,
            };
            if newer {
                best = Some((modified, path));
            }
        }
    }
    Ok(best.map(|(_, path)| path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::{set_file_mtime, FileTime};

    #[test]
    fn atomic_write_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("active.pth");
        atomic_write(&target, b"old").unwrap();
        atomic_write(&target, b"new").unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"new");

        let leftovers: Vec<_> = std::fs::read_dir(target.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn newest_file_uses_mtime_and_extension() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("run");
        std::fs::create_dir_all(&sub).unwrap();

        let old = dir.path().join("epoch1.pth");
        let new = sub.join("epoch2.pth");
        let newer_other = dir.path().join("config.yaml");
        for path in [&old, &new, &newer_other] {
            std::fs::write(path, b"x").unwrap();
        }
        set_file_mtime(&old, FileTime::from_unix_time(1_000, 0)).unwrap();
        set_file_mtime(&new, FileTime::from_unix_time(2_000, 0)).unwrap();
        set_file_mtime(&newer_other, FileTime::from_unix_time(3_000, 0)).unwrap();

        assert_eq!(newest_file(dir.path(), "pth").unwrap(), Some(new));
    }

    #[test]
    fn newest_file_none_when_nothing_matches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("log.txt"), b"x").unwrap();
        assert_eq!(newest_file(dir.path(), "pth").unwrap(), None);
        assert_eq!(newest_file(&dir.path().join("missing"), "pth").unwrap(), None);
    }

    #[test]
    fn modified_at_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(modified_at(&dir.path().join("nope")).unwrap().is_none());
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        assert!(modified_at(&file).unwrap().is_some());
    }
}
